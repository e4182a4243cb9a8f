//! # Session Store
//!
//! One persisted session per active login, identified externally by the
//! fingerprint of its access token. A session's expiry is fixed when it is
//! created (normal or remember-me policy); only `last_activity_at` advances.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{AuthError, AuthResult};
use crate::gateway::TransactionGateway;
use crate::models::session::Model as Session;
use crate::repositories::SessionRepository;

/// Client metadata recorded with a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
}

impl DeviceInfo {
    /// Build device metadata from request values, classifying the user agent.
    pub fn from_request(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        let (device_type, browser, os) = match user_agent.as_deref() {
            Some(ua) if !ua.trim().is_empty() => (
                Some(classify_device(ua).to_string()),
                Some(classify_browser(ua).to_string()),
                Some(classify_os(ua).to_string()),
            ),
            _ => (None, None, None),
        };

        Self {
            ip_address,
            user_agent,
            device_type,
            browser,
            os,
        }
    }
}

fn classify_device(ua: &str) -> &'static str {
    let ua = ua.to_ascii_lowercase();
    if ua.contains("ipad") || ua.contains("tablet") {
        "tablet"
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        "mobile"
    } else if ua.contains("bot") || ua.contains("curl") || ua.contains("httpie") {
        "bot"
    } else {
        "desktop"
    }
}

fn classify_browser(ua: &str) -> &'static str {
    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari
    if ua.contains("Edg/") || ua.contains("Edge/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("Firefox/") {
        "Firefox"
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        "Chrome"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        "Other"
    }
}

fn classify_os(ua: &str) -> &'static str {
    if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iOS") {
        "iOS"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "macOS"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "Other"
    }
}

/// Input for [`SessionStore::create`]. The id is chosen by the caller so it
/// can be embedded in the tokens before the row exists.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub fingerprint: String,
    pub device: DeviceInfo,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
}

impl NewSession {
    pub fn new(
        user_id: Uuid,
        tenant_id: Uuid,
        fingerprint: impl Into<String>,
        device: DeviceInfo,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            fingerprint: fingerprint.into(),
            device,
            expires_at,
            remember_me: false,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }
}

#[derive(Clone)]
pub struct SessionStore {
    gateway: TransactionGateway,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(gateway: TransactionGateway, config: SessionConfig) -> Self {
        Self { gateway, config }
    }

    /// Absolute expiry for a session created now.
    pub fn expiry_for(&self, remember_me: bool) -> DateTime<Utc> {
        let ttl = if remember_me {
            self.config.remember_me_ttl_seconds
        } else {
            self.config.ttl_seconds
        };
        Utc::now() + chrono::Duration::seconds(ttl as i64)
    }

    #[instrument(skip_all, fields(tenant_id = %new.tenant_id, user_id = %new.user_id))]
    pub async fn create(&self, new: NewSession) -> AuthResult<Session> {
        let now = Utc::now();
        let tenant_id = new.tenant_id;
        let model = Session {
            id: new.id,
            tenant_id,
            user_id: new.user_id,
            token_fingerprint: new.fingerprint,
            ip_address: new.device.ip_address,
            user_agent: new.device.user_agent,
            device_type: new.device.device_type,
            browser: new.device.browser,
            os: new.device.os,
            remember_me: new.remember_me,
            last_activity_at: now,
            expires_at: new.expires_at,
            created_at: now,
        };

        let session = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn).insert(model).await
            })
            .await?;

        info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    pub async fn find_by_id(&self, tenant_id: Uuid, session_id: Uuid) -> AuthResult<Session> {
        let session = self
            .gateway
            .run_read_only(tenant_id, |txn| async move {
                SessionRepository::new(&txn).find_by_id(session_id).await
            })
            .await?;

        session
            .filter(|s| s.expires_at > Utc::now())
            .ok_or_else(|| AuthError::NotFound("session not found".into()))
    }

    /// Rebind a live session to a new access token fingerprint. Expiry is
    /// unchanged.
    pub async fn rotate_fingerprint(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        fingerprint: &str,
    ) -> AuthResult<()> {
        let fingerprint = fingerprint.to_string();
        let updated = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn)
                    .update_fingerprint(session_id, &fingerprint)
                    .await
            })
            .await?;

        if updated == 0 {
            return Err(AuthError::NotFound("session not found".into()));
        }
        Ok(())
    }

    /// Live session for `fingerprint`. Expired sessions are `NotFound`.
    pub async fn find_by_fingerprint(&self, tenant_id: Uuid, fingerprint: &str) -> AuthResult<Session> {
        let fingerprint = fingerprint.to_string();
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                SessionRepository::new(&txn)
                    .find_live_by_fingerprint(&fingerprint)
                    .await
            })
            .await?
            .ok_or_else(|| AuthError::NotFound("session not found".into()))
    }

    /// Advance last activity. Failures are logged and swallowed.
    pub async fn touch(&self, tenant_id: Uuid, session_id: Uuid) {
        let result = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn).touch(session_id, Utc::now()).await
            })
            .await;

        if let Err(err) = result {
            warn!(
                tenant_id = %tenant_id,
                session_id = %session_id,
                error = %err,
                "Failed to update session activity"
            );
        }
    }

    /// Live sessions, most recently active first.
    pub async fn list_active(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<Vec<Session>> {
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                SessionRepository::new(&txn).list_live_for_user(user_id).await
            })
            .await
    }

    pub async fn revoke(&self, tenant_id: Uuid, session_id: Uuid) -> AuthResult<u64> {
        let removed = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn).delete_by_id(session_id).await
            })
            .await?;
        debug!(tenant_id = %tenant_id, session_id = %session_id, removed, "Session revoked");
        Ok(removed)
    }

    pub async fn revoke_by_fingerprint(&self, tenant_id: Uuid, fingerprint: &str) -> AuthResult<u64> {
        let fingerprint = fingerprint.to_string();
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn)
                    .delete_by_fingerprint(&fingerprint)
                    .await
            })
            .await
    }

    pub async fn revoke_all_for_user(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<u64> {
        let removed = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn).delete_for_user(user_id, None).await
            })
            .await?;
        info!(tenant_id = %tenant_id, user_id = %user_id, removed, "All sessions revoked");
        Ok(removed)
    }

    pub async fn revoke_all_except(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        keep_fingerprint: &str,
    ) -> AuthResult<u64> {
        let keep = keep_fingerprint.to_string();
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                SessionRepository::new(&txn)
                    .delete_for_user(user_id, Some(&keep))
                    .await
            })
            .await
    }

    /// Delete sessions whose expiry has passed, across all tenants.
    pub async fn sweep_expired(&self) -> AuthResult<u64> {
        let removed = self
            .gateway
            .run_with_bypass(|txn| async move {
                SessionRepository::new(&txn).delete_expired(Utc::now()).await
            })
            .await?;
        if removed > 0 {
            info!(removed, "Swept expired sessions");
        }
        Ok(removed)
    }

    /// Delete sessions idle for longer than `max_inactivity`, across all tenants.
    pub async fn sweep_inactive(&self, max_inactivity: Duration) -> AuthResult<u64> {
        let max_inactivity = chrono::Duration::from_std(max_inactivity)
            .map_err(|e| AuthError::internal("invalid inactivity window", e))?;
        let cutoff = Utc::now() - max_inactivity;

        let removed = self
            .gateway
            .run_with_bypass(|txn| async move {
                SessionRepository::new(&txn)
                    .delete_inactive_since(cutoff)
                    .await
            })
            .await?;
        if removed > 0 {
            info!(removed, "Swept inactive sessions");
        }
        Ok(removed)
    }

    pub fn max_inactivity(&self) -> Duration {
        Duration::from_secs(self.config.max_inactivity_seconds)
    }
}
