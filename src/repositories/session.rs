//! # Session Repository
//!
//! Liveness queries filter on `expires_at > now`, so an expired session reads
//! as absent. Deletes are idempotent and report the number of rows removed.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use uuid::Uuid;

use crate::error::AuthResult;
use crate::gateway::ScopedTxn;
use crate::models::session::{self, ActiveModel, Entity as Session, Model};

pub struct SessionRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> SessionRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn insert(&self, model: Model) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(model.tenant_id)?;

        Session::insert(ActiveModel::from(model.clone()))
            .exec_without_returning(self.txn.conn())
            .await?;
        Ok(model)
    }

    pub async fn find_live_by_fingerprint(&self, fingerprint: &str) -> AuthResult<Option<Model>> {
        Ok(Session::find()
            .filter(session::Column::TokenFingerprint.eq(fingerprint))
            .filter(session::Column::ExpiresAt.gt(Utc::now()))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    pub async fn find_by_id(&self, session_id: Uuid) -> AuthResult<Option<Model>> {
        Ok(Session::find_by_id(session_id)
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .one(self.txn.conn())
            .await?)
    }

    /// Live sessions of a user, most recently active first.
    pub async fn list_live_for_user(&self, user_id: Uuid) -> AuthResult<Vec<Model>> {
        Ok(Session::find()
            .filter(session::Column::UserId.eq(user_id))
            .filter(session::Column::ExpiresAt.gt(Utc::now()))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .order_by_desc(session::Column::LastActivityAt)
            .all(self.txn.conn())
            .await?)
    }

    pub async fn touch(&self, session_id: Uuid, at: DateTime<Utc>) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Session::update_many()
            .col_expr(session::Column::LastActivityAt, Expr::value(at))
            .filter(session::Column::Id.eq(session_id))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }

    /// Point a live session at a newly issued access token.
    pub async fn update_fingerprint(&self, session_id: Uuid, fingerprint: &str) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Session::update_many()
            .col_expr(session::Column::TokenFingerprint, Expr::value(fingerprint))
            .col_expr(session::Column::LastActivityAt, Expr::value(Utc::now()))
            .filter(session::Column::Id.eq(session_id))
            .filter(session::Column::ExpiresAt.gt(Utc::now()))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn delete_by_id(&self, session_id: Uuid) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Session::delete_many()
            .filter(session::Column::Id.eq(session_id))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn delete_by_fingerprint(&self, fingerprint: &str) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Session::delete_many()
            .filter(session::Column::TokenFingerprint.eq(fingerprint))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }

    /// Delete every session of `user_id`, optionally sparing one fingerprint.
    pub async fn delete_for_user(&self, user_id: Uuid, keep: Option<&str>) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let mut query = Session::delete_many()
            .filter(session::Column::UserId.eq(user_id))
            .filter(self.txn.scope().filter(session::Column::TenantId));
        if let Some(fingerprint) = keep {
            query = query.filter(session::Column::TokenFingerprint.ne(fingerprint));
        }
        let result = query.exec(self.txn.conn()).await?;
        Ok(result.rows_affected)
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Session::delete_many()
            .filter(session::Column::ExpiresAt.lte(now))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn delete_inactive_since(&self, cutoff: DateTime<Utc>) -> AuthResult<u64> {
        self.txn.ensure_writable()?;
        let result = Session::delete_many()
            .filter(session::Column::LastActivityAt.lt(cutoff))
            .filter(self.txn.scope().filter(session::Column::TenantId))
            .exec(self.txn.conn())
            .await?;
        Ok(result.rows_affected)
    }
}
