//! # Role Repository
//!
//! Roles, their permission sets and user assignments. Set-valued writes use
//! replace semantics: the old set is deleted and the new one inserted in the
//! same transaction.

use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::gateway::ScopedTxn;
use crate::models::role::{self, ActiveModel, Entity as Role, Model};
use crate::models::{role_permission, user_role};

pub struct RoleRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> RoleRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn insert(&self, model: Model) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(model.tenant_id)?;

        Role::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.txn.conn())
            .await
            .map_err(|e| match AuthError::from(e) {
                AuthError::Conflict(_) => {
                    AuthError::Conflict(format!("role '{}' already exists", model.name))
                }
                other => other,
            })?;
        Ok(model)
    }

    pub async fn find_by_id(&self, role_id: Uuid) -> AuthResult<Option<Model>> {
        Ok(Role::find_by_id(role_id)
            .filter(self.txn.scope().filter(role::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn find_by_name(&self, tenant_id: Uuid, name: &str) -> AuthResult<Option<Model>> {
        self.txn.scope().authorize(tenant_id)?;
        Ok(Role::find()
            .filter(role::Column::TenantId.eq(tenant_id))
            .filter(role::Column::Name.eq(name))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn list(&self, tenant_id: Uuid) -> AuthResult<Vec<Model>> {
        self.txn.scope().authorize(tenant_id)?;
        Ok(Role::find()
            .filter(role::Column::TenantId.eq(tenant_id))
            .order_by_asc(role::Column::Name)
            .all(self.txn.conn())
            .await?)
    }

    /// Roles in `role_ids` that are visible to the scope. Missing ids are
    /// silently dropped; callers compare lengths.
    pub async fn find_many(&self, role_ids: &[Uuid]) -> AuthResult<Vec<Model>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(Role::find()
            .filter(role::Column::Id.is_in(role_ids.iter().copied()))
            .filter(self.txn.scope().filter(role::Column::TenantId))
            .all(self.txn.conn())
            .await?)
    }

    pub async fn delete(&self, role_id: Uuid) -> AuthResult<bool> {
        self.txn.ensure_writable()?;
        let result = Role::delete_many()
            .filter(role::Column::Id.eq(role_id))
            .filter(self.txn.scope().filter(role::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn permission_ids(&self, role_id: Uuid) -> AuthResult<Vec<Uuid>> {
        Ok(role_permission::Entity::find()
            .select_only()
            .column(role_permission::Column::PermissionId)
            .filter(role_permission::Column::RoleId.eq(role_id))
            .filter(self.txn.scope().filter(role_permission::Column::TenantId))
            .into_tuple()
            .all(self.txn.conn())
            .await?)
    }

    /// Replace the permission set of `role`.
    pub async fn replace_permissions(&self, role: &Model, permission_ids: &[Uuid]) -> AuthResult<()> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(role.tenant_id)?;

        role_permission::Entity::delete_many()
            .filter(role_permission::Column::RoleId.eq(role.id))
            .filter(role_permission::Column::TenantId.eq(role.tenant_id))
            .exec(self.txn.conn())
            .await?;

        if permission_ids.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let rows = dedup(permission_ids)
            .into_iter()
            .map(|permission_id| role_permission::ActiveModel::from(role_permission::Model {
                tenant_id: role.tenant_id,
                role_id: role.id,
                permission_id,
                created_at: now,
            }));
        role_permission::Entity::insert_many(rows)
            .exec_without_returning(self.txn.conn())
            .await?;
        Ok(())
    }

    pub async fn role_ids_for_user(&self, user_id: Uuid) -> AuthResult<Vec<Uuid>> {
        Ok(user_role::Entity::find()
            .select_only()
            .column(user_role::Column::RoleId)
            .filter(user_role::Column::UserId.eq(user_id))
            .filter(self.txn.scope().filter(user_role::Column::TenantId))
            .into_tuple()
            .all(self.txn.conn())
            .await?)
    }

    pub async fn roles_for_user(&self, user_id: Uuid) -> AuthResult<Vec<Model>> {
        let role_ids = self.role_ids_for_user(user_id).await?;
        let mut roles = self.find_many(&role_ids).await?;
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    pub async fn user_ids_with_role(&self, role_id: Uuid) -> AuthResult<Vec<Uuid>> {
        Ok(user_role::Entity::find()
            .select_only()
            .column(user_role::Column::UserId)
            .filter(user_role::Column::RoleId.eq(role_id))
            .filter(self.txn.scope().filter(user_role::Column::TenantId))
            .into_tuple()
            .all(self.txn.conn())
            .await?)
    }

    /// Replace every role assignment of `user_id` in `tenant_id`.
    pub async fn replace_user_roles(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role_ids: &[Uuid],
    ) -> AuthResult<()> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(tenant_id)?;

        user_role::Entity::delete_many()
            .filter(user_role::Column::UserId.eq(user_id))
            .filter(user_role::Column::TenantId.eq(tenant_id))
            .exec(self.txn.conn())
            .await?;

        if role_ids.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let rows = dedup(role_ids).into_iter().map(|role_id| {
            user_role::ActiveModel::from(user_role::Model {
                tenant_id,
                user_id,
                role_id,
                created_at: now,
            })
        });
        user_role::Entity::insert_many(rows)
            .exec_without_returning(self.txn.conn())
            .await?;
        Ok(())
    }
}

fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(id) {
            seen.push(*id);
        }
    }
    seen
}
