//! # Tenant Repository
//!
//! Tenants live outside row-level security. Reads are open to any scope;
//! state changes require the tenant's own scope or bypass.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::gateway::ScopedTxn;
use crate::models::tenant::{self, ActiveModel, Entity as Tenant, Model, TenantStatus};

pub struct TenantRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> TenantRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn insert(&self, model: Model) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        Tenant::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.txn.conn())
            .await
            .map_err(|e| match AuthError::from(e) {
                AuthError::Conflict(_) => AuthError::Conflict("tenant slug already taken".into()),
                other => other,
            })?;
        Ok(model)
    }

    pub async fn find_by_id(&self, tenant_id: Uuid) -> AuthResult<Option<Model>> {
        Ok(Tenant::find_by_id(tenant_id).one(self.txn.conn()).await?)
    }

    pub async fn find_by_slug(&self, slug: &str) -> AuthResult<Option<Model>> {
        Ok(Tenant::find()
            .filter(tenant::Column::Slug.eq(slug))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn slug_exists(&self, slug: &str) -> AuthResult<bool> {
        let count = Tenant::find()
            .filter(tenant::Column::Slug.eq(slug))
            .count(self.txn.conn())
            .await?;
        Ok(count > 0)
    }

    /// Lookup by an unexpired verification token.
    pub async fn find_by_verification_token(&self, token: &str) -> AuthResult<Option<Model>> {
        Ok(Tenant::find()
            .filter(tenant::Column::VerificationToken.eq(token))
            .filter(tenant::Column::VerificationTokenExpiresAt.gt(Utc::now()))
            .one(self.txn.conn())
            .await?)
    }

    /// Activate the tenant and consume its verification token.
    pub async fn mark_verified(&self, tenant_id: Uuid) -> AuthResult<()> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(tenant_id)?;

        let now = Utc::now();
        let result = Tenant::update_many()
            .col_expr(tenant::Column::Status, Expr::value(TenantStatus::Active))
            .col_expr(tenant::Column::EmailVerifiedAt, Expr::value(Some(now)))
            .col_expr(tenant::Column::VerificationToken, Expr::value(None::<String>))
            .col_expr(
                tenant::Column::VerificationTokenExpiresAt,
                Expr::value(None::<chrono::DateTime<Utc>>),
            )
            .col_expr(tenant::Column::UpdatedAt, Expr::value(now))
            .filter(tenant::Column::Id.eq(tenant_id))
            .exec(self.txn.conn())
            .await?;

        if result.rows_affected == 0 {
            return Err(AuthError::NotFound("tenant not found".into()));
        }
        Ok(())
    }

    pub async fn set_status(&self, tenant_id: Uuid, status: TenantStatus) -> AuthResult<()> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(tenant_id)?;

        Tenant::update_many()
            .col_expr(tenant::Column::Status, Expr::value(status))
            .col_expr(tenant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(tenant::Column::Id.eq(tenant_id))
            .exec(self.txn.conn())
            .await?;
        Ok(())
    }
}
