//! # Permission Repository
//!
//! The permission catalog is global; effective-permission queries join through
//! the tenant-scoped role tables.

use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::error::AuthResult;
use crate::gateway::ScopedTxn;
use crate::models::permission::{self, ActiveModel, Entity as Permission, Model};
use crate::models::{role_permission, user_role};

pub struct PermissionRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> PermissionRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn list_all(&self) -> AuthResult<Vec<Model>> {
        Ok(Permission::find()
            .order_by_asc(permission::Column::Resource)
            .order_by_asc(permission::Column::Action)
            .all(self.txn.conn())
            .await?)
    }

    pub async fn find(&self, resource: &str, action: &str) -> AuthResult<Option<Model>> {
        Ok(Permission::find()
            .filter(permission::Column::Resource.eq(resource))
            .filter(permission::Column::Action.eq(action))
            .one(self.txn.conn())
            .await?)
    }

    /// Insert the catalog entry unless (resource, action) already exists.
    pub async fn ensure(
        &self,
        resource: &str,
        action: &str,
        category: &str,
        description: Option<&str>,
    ) -> AuthResult<Model> {
        if let Some(existing) = self.find(resource, action).await? {
            return Ok(existing);
        }

        self.txn.ensure_writable()?;
        let model = Model {
            id: Uuid::new_v4(),
            resource: resource.to_string(),
            action: action.to_string(),
            category: category.to_string(),
            description: description.map(str::to_string),
            created_at: Utc::now(),
        };
        Permission::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.txn.conn())
            .await?;
        Ok(model)
    }

    /// Union of permissions across every role assigned to `user_id`, one entry
    /// per permission.
    pub async fn effective_for_user(&self, user_id: Uuid) -> AuthResult<Vec<Model>> {
        let scope = self.txn.scope();
        let role_ids: Vec<Uuid> = user_role::Entity::find()
            .select_only()
            .column(user_role::Column::RoleId)
            .filter(user_role::Column::UserId.eq(user_id))
            .filter(scope.filter(user_role::Column::TenantId))
            .into_tuple()
            .all(self.txn.conn())
            .await?;

        if role_ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(Permission::find()
            .inner_join(role_permission::Entity)
            .filter(role_permission::Column::RoleId.is_in(role_ids))
            .filter(scope.filter(role_permission::Column::TenantId))
            .distinct()
            .order_by_asc(permission::Column::Resource)
            .order_by_asc(permission::Column::Action)
            .all(self.txn.conn())
            .await?)
    }
}
