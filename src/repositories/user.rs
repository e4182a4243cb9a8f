//! # User Repository

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::gateway::ScopedTxn;
use crate::models::user::{self, ActiveModel, Entity as User, Model, UserStatus};

/// Encrypted two-factor columns written together.
#[derive(Debug, Clone, Default)]
pub struct TwoFactorColumns {
    pub enabled: bool,
    pub secret: Option<String>,
    pub backup_codes: Option<String>,
}

pub struct UserRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> UserRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn insert(&self, model: Model) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(model.tenant_id)?;

        User::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.txn.conn())
            .await
            .map_err(|e| match AuthError::from(e) {
                AuthError::Conflict(_) => {
                    AuthError::Conflict("email already registered for this tenant".into())
                }
                other => other,
            })?;
        Ok(model)
    }

    pub async fn find_by_id(&self, user_id: Uuid) -> AuthResult<Option<Model>> {
        Ok(User::find_by_id(user_id)
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    /// Fetch a user that must exist in scope.
    pub async fn get(&self, user_id: Uuid) -> AuthResult<Model> {
        self.find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("user not found".into()))
    }

    /// Fetch and row-lock a user for a read-modify-write inside this
    /// transaction. The lock is a no-op on SQLite, where writers serialize.
    pub async fn get_for_update(&self, user_id: Uuid) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        User::find_by_id(user_id)
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .lock_exclusive()
            .one(self.txn.conn())
            .await?
            .ok_or_else(|| AuthError::NotFound("user not found".into()))
    }

    pub async fn find_by_email(&self, email: &str) -> AuthResult<Option<Model>> {
        Ok(User::find()
            .filter(user::Column::Email.eq(email))
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    /// Every user row with this email visible to the scope, oldest first.
    /// Under bypass this spans tenants.
    pub async fn find_all_by_email(&self, email: &str) -> AuthResult<Vec<Model>> {
        Ok(User::find()
            .filter(user::Column::Email.eq(email))
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .order_by_asc(user::Column::CreatedAt)
            .all(self.txn.conn())
            .await?)
    }

    /// The oldest user of the scoped tenant, i.e. the one created at registration.
    pub async fn find_founding_user(&self, tenant_id: Uuid) -> AuthResult<Option<Model>> {
        self.txn.scope().authorize(tenant_id)?;
        Ok(User::find()
            .filter(user::Column::TenantId.eq(tenant_id))
            .order_by_asc(user::Column::CreatedAt)
            .one(self.txn.conn())
            .await?)
    }

    pub async fn find_by_reset_token(&self, token: &str) -> AuthResult<Option<Model>> {
        Ok(User::find()
            .filter(user::Column::PasswordResetToken.eq(token))
            .filter(user::Column::PasswordResetExpiresAt.gt(Utc::now()))
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn activate(&self, user_id: Uuid) -> AuthResult<()> {
        self.update(
            user_id,
            vec![
                (user::Column::Status, Expr::value(UserStatus::Active)),
                (user::Column::EmailVerified, Expr::value(true)),
            ],
        )
        .await
    }

    pub async fn set_status(&self, user_id: Uuid, status: UserStatus) -> AuthResult<()> {
        self.update(user_id, vec![(user::Column::Status, Expr::value(status))])
            .await
    }

    /// Replace the password hash and consume any outstanding reset token.
    pub async fn update_password(&self, user_id: Uuid, password_hash: &str) -> AuthResult<()> {
        self.update(
            user_id,
            vec![
                (user::Column::PasswordHash, Expr::value(password_hash)),
                (user::Column::PasswordResetToken, Expr::value(None::<String>)),
                (
                    user::Column::PasswordResetExpiresAt,
                    Expr::value(None::<DateTime<Utc>>),
                ),
            ],
        )
        .await
    }

    pub async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<()> {
        self.update(
            user_id,
            vec![
                (user::Column::PasswordResetToken, Expr::value(token)),
                (user::Column::PasswordResetExpiresAt, Expr::value(expires_at)),
            ],
        )
        .await
    }

    pub async fn update_last_login(&self, user_id: Uuid) -> AuthResult<()> {
        self.update(
            user_id,
            vec![(user::Column::LastLoginAt, Expr::value(Utc::now()))],
        )
        .await
    }

    pub async fn set_two_factor(&self, user_id: Uuid, columns: TwoFactorColumns) -> AuthResult<()> {
        self.update(
            user_id,
            vec![
                (user::Column::TwoFactorEnabled, Expr::value(columns.enabled)),
                (user::Column::TwoFactorSecret, Expr::value(columns.secret)),
                (
                    user::Column::TwoFactorBackupCodes,
                    Expr::value(columns.backup_codes),
                ),
            ],
        )
        .await
    }

    pub async fn set_backup_codes(&self, user_id: Uuid, encoded: Option<String>) -> AuthResult<()> {
        self.update(
            user_id,
            vec![(user::Column::TwoFactorBackupCodes, Expr::value(encoded))],
        )
        .await
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, user_id: Uuid) -> AuthResult<bool> {
        self.txn.ensure_writable()?;
        let result = User::delete_many()
            .filter(user::Column::Id.eq(user_id))
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn update(&self, user_id: Uuid, values: Vec<(user::Column, SimpleExpr)>) -> AuthResult<()> {
        self.txn.ensure_writable()?;

        let mut query = User::update_many();
        for (column, value) in values {
            query = query.col_expr(column, value);
        }
        let result = query
            .col_expr(user::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(user::Column::Id.eq(user_id))
            .filter(self.txn.scope().filter(user::Column::TenantId))
            .exec(self.txn.conn())
            .await?;

        if result.rows_affected == 0 {
            return Err(AuthError::NotFound("user not found".into()));
        }
        Ok(())
    }
}
