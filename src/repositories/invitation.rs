//! # Invitation Repository

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::gateway::ScopedTxn;
use crate::models::invitation::{self, ActiveModel, Entity as Invitation, InvitationStatus, Model};

pub struct InvitationRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> InvitationRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn insert(&self, model: Model) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(model.tenant_id)?;

        Invitation::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.txn.conn())
            .await?;
        Ok(model)
    }

    pub async fn find_by_id(&self, invitation_id: Uuid) -> AuthResult<Option<Model>> {
        Ok(Invitation::find_by_id(invitation_id)
            .filter(self.txn.scope().filter(invitation::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn find_by_token(&self, token: &str) -> AuthResult<Option<Model>> {
        Ok(Invitation::find()
            .filter(invitation::Column::Token.eq(token))
            .filter(self.txn.scope().filter(invitation::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn list_pending(&self, tenant_id: Uuid) -> AuthResult<Vec<Model>> {
        self.txn.scope().authorize(tenant_id)?;
        Ok(Invitation::find()
            .filter(invitation::Column::TenantId.eq(tenant_id))
            .filter(invitation::Column::Status.eq(InvitationStatus::Pending))
            .order_by_desc(invitation::Column::CreatedAt)
            .all(self.txn.conn())
            .await?)
    }

    /// Revoke any pending invitation for `email` in `tenant_id`.
    pub async fn revoke_pending_for_email(&self, tenant_id: Uuid, email: &str) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(tenant_id)?;

        let result = Invitation::update_many()
            .col_expr(invitation::Column::Status, Expr::value(InvitationStatus::Revoked))
            .col_expr(invitation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(invitation::Column::TenantId.eq(tenant_id))
            .filter(invitation::Column::Email.eq(email))
            .filter(invitation::Column::Status.eq(InvitationStatus::Pending))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }

    /// Move a pending invitation to `status`. Fails with `Conflict` when the
    /// invitation was already processed.
    pub async fn transition(
        &self,
        invitation_id: Uuid,
        status: InvitationStatus,
    ) -> AuthResult<()> {
        self.txn.ensure_writable()?;

        let now = Utc::now();
        let mut query = Invitation::update_many()
            .col_expr(invitation::Column::Status, Expr::value(status))
            .col_expr(invitation::Column::UpdatedAt, Expr::value(now));
        if status == InvitationStatus::Accepted {
            query = query.col_expr(invitation::Column::AcceptedAt, Expr::value(Some(now)));
        }

        let result = query
            .filter(invitation::Column::Id.eq(invitation_id))
            .filter(invitation::Column::Status.eq(InvitationStatus::Pending))
            .filter(self.txn.scope().filter(invitation::Column::TenantId))
            .exec(self.txn.conn())
            .await?;

        if result.rows_affected == 0 {
            return Err(AuthError::Conflict(
                "invitation already processed".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark pending invitations past their expiry as expired.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Invitation::update_many()
            .col_expr(invitation::Column::Status, Expr::value(InvitationStatus::Expired))
            .col_expr(invitation::Column::UpdatedAt, Expr::value(now))
            .filter(invitation::Column::Status.eq(InvitationStatus::Pending))
            .filter(invitation::Column::ExpiresAt.lte(now))
            .filter(self.txn.scope().filter(invitation::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }
}
