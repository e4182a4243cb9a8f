//! # Audit Log Repository
//!
//! Append-only: there is no update or delete.

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use uuid::Uuid;

use crate::error::AuthResult;
use crate::gateway::ScopedTxn;
use crate::models::audit_log::{self, ActiveModel, Entity as AuditLog, Model};

pub struct AuditLogRepository<'a> {
    txn: &'a ScopedTxn,
}

impl<'a> AuditLogRepository<'a> {
    pub fn new(txn: &'a ScopedTxn) -> Self {
        Self { txn }
    }

    pub async fn append(&self, entry: Model) -> AuthResult<Model> {
        self.txn.ensure_writable()?;
        self.txn.scope().authorize(entry.tenant_id)?;

        AuditLog::insert(ActiveModel::from(entry.clone()))
            .exec_without_returning(self.txn.conn())
            .await?;
        Ok(entry)
    }

    /// Most recent entries first.
    pub async fn recent(&self, tenant_id: Uuid, limit: u64) -> AuthResult<Vec<Model>> {
        self.txn.scope().authorize(tenant_id)?;
        Ok(AuditLog::find()
            .filter(audit_log::Column::TenantId.eq(tenant_id))
            .order_by_desc(audit_log::Column::CreatedAt)
            .limit(limit)
            .all(self.txn.conn())
            .await?)
    }
}
