//! # Audit Write Path
//!
//! Append-only audit records. [`AuditLogger::record_in`] writes inside the
//! caller's transaction so the entry commits or rolls back with the change it
//! describes; [`AuditLogger::record`] is best-effort in its own transaction.

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use crate::error::AuthResult;
use crate::gateway::{ScopedTxn, TransactionGateway};
use crate::models::audit_log::{AuditStatus, Model as AuditLog};
use crate::repositories::AuditLogRepository;
use crate::sessions::DeviceInfo;

pub mod actions {
    pub const REGISTER: &str = "register";
    pub const EMAIL_VERIFIED: &str = "email_verified";
    pub const LOGIN: &str = "login";
    pub const LOGOUT: &str = "logout";
    pub const LOGOUT_ALL: &str = "logout_all";
    pub const PASSWORD_RESET: &str = "password_reset";
    pub const PASSWORD_CHANGE: &str = "password_change";
    pub const TWO_FACTOR_ENABLE: &str = "2fa_enable";
    pub const TWO_FACTOR_DISABLE: &str = "2fa_disable";
    pub const INVITATION_CREATE: &str = "invitation_create";
    pub const INVITATION_ACCEPT: &str = "invitation_accept";
    pub const INVITATION_REVOKE: &str = "invitation_revoke";
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub status: AuditStatus,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl AuditEntry {
    pub fn success(tenant_id: Uuid, action: &str, resource: &str) -> Self {
        Self::new(tenant_id, action, resource, AuditStatus::Success)
    }

    pub fn failure(tenant_id: Uuid, action: &str, resource: &str) -> Self {
        Self::new(tenant_id, action, resource, AuditStatus::Failure)
    }

    fn new(tenant_id: Uuid, action: &str, resource: &str, status: AuditStatus) -> Self {
        Self {
            tenant_id,
            user_id: None,
            action: action.to_string(),
            resource: resource.to_string(),
            resource_id: None,
            status,
            ip_address: None,
            user_agent: None,
            metadata: None,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn resource_id(mut self, resource_id: impl ToString) -> Self {
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn device(mut self, device: &DeviceInfo) -> Self {
        self.ip_address = device.ip_address.clone();
        self.user_agent = device.user_agent.clone();
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn into_model(self) -> AuditLog {
        AuditLog {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            action: self.action,
            resource: self.resource,
            resource_id: self.resource_id,
            status: self.status,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    gateway: TransactionGateway,
}

impl AuditLogger {
    pub fn new(gateway: TransactionGateway) -> Self {
        Self { gateway }
    }

    pub async fn record_in(txn: &ScopedTxn, entry: AuditEntry) -> AuthResult<()> {
        AuditLogRepository::new(txn).append(entry.into_model()).await?;
        Ok(())
    }

    /// Append in a separate transaction. Failures are logged, never returned.
    pub async fn record(&self, entry: AuditEntry) {
        let tenant_id = entry.tenant_id;
        let action = entry.action.clone();

        let result = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                Self::record_in(&txn, entry).await
            })
            .await;

        if let Err(err) = result {
            warn!(tenant_id = %tenant_id, action = %action, error = %err, "Failed to write audit log");
        }
    }

    pub async fn recent(&self, tenant_id: Uuid, limit: u64) -> AuthResult<Vec<AuditLog>> {
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                AuditLogRepository::new(&txn).recent(tenant_id, limit).await
            })
            .await
    }
}
