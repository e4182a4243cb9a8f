//! # Authentication Orchestrator
//!
//! Registration, email verification, login, 2FA completion, refresh, logout and
//! password flows. Login moves through
//! `password_check -> [2FA required -> challenge_issued -> code_verified] -> session_created`.
//!
//! Credential, token and account-state failures all collapse into
//! [`AuthError::InvalidCredentials`] or [`AuthError::InvalidToken`]; the
//! specific reason is only logged and audited.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, actions};
use crate::cache::CacheStore;
use crate::credentials::{PasswordHasher, TokenEngine, TokenKind, TokenSubject, fingerprint};
use crate::crypto;
use crate::error::{AuthError, AuthResult};
use crate::gateway::TransactionGateway;
use crate::mail::{MailOutbox, OutboundEmail, templates};
use crate::models::tenant::Model as Tenant;
use crate::models::user::{Model as User, UserStatus};
use crate::rbac::provision_system_roles;
use crate::repositories::{RoleRepository, SessionRepository, TenantRepository, UserRepository};
use crate::seeds::permissions::OWNER_ROLE;
use crate::sessions::{DeviceInfo, NewSession, SessionStore};
use crate::two_factor::{TwoFactorEngine, TwoFactorSetup};
use crate::validation;

const VERIFICATION_TOKEN_BYTES: usize = 32;
const RESET_TOKEN_BYTES: usize = 32;

pub fn challenge_used_key(jti: Uuid) -> String {
    format!("2fa_challenge_used:{jti}")
}

#[derive(Debug, Clone)]
pub struct RegisterTenant {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone)]
pub struct RegisterAdmin {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Required when the email exists in more than one tenant.
    pub tenant_id: Option<Uuid>,
    pub remember_me: bool,
    pub device: DeviceInfo,
    /// Client-supplied device identifier, paired with `device_token` to skip
    /// 2FA on a trusted device.
    pub device_fingerprint: Option<String>,
    pub device_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TwoFactorCompletion {
    pub challenge_token: String,
    pub code: String,
    /// When set, the device is remembered and a trusted-device token returned.
    pub trust_device: Option<String>,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantChoice {
    pub tenant_id: Uuid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_device_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    MultiTenantChoice { tenants: Vec<TenantChoice> },
    TwoFactorChallenge { challenge_token: String, expires_in: u64 },
    Authenticated(AuthTokens),
}

#[derive(Clone)]
pub struct AuthOrchestrator {
    gateway: TransactionGateway,
    tokens: TokenEngine,
    passwords: PasswordHasher,
    sessions: SessionStore,
    two_factor: TwoFactorEngine,
    audit: AuditLogger,
    outbox: MailOutbox,
    cache: Arc<dyn CacheStore>,
    base_url: String,
    verification_ttl: chrono::Duration,
    reset_ttl: chrono::Duration,
}

/// Lifetimes and link base used by the orchestrator's emails and tokens.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub base_url: String,
    pub verification_ttl_seconds: u64,
    pub reset_ttl_seconds: u64,
}

impl AuthOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: TransactionGateway,
        tokens: TokenEngine,
        passwords: PasswordHasher,
        sessions: SessionStore,
        two_factor: TwoFactorEngine,
        audit: AuditLogger,
        outbox: MailOutbox,
        cache: Arc<dyn CacheStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            gateway,
            tokens,
            passwords,
            sessions,
            two_factor,
            audit,
            outbox,
            cache,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            verification_ttl: chrono::Duration::seconds(settings.verification_ttl_seconds as i64),
            reset_ttl: chrono::Duration::seconds(settings.reset_ttl_seconds as i64),
        }
    }

    /// Create a tenant awaiting verification together with its founding
    /// user. The verification email is queued after commit.
    #[instrument(skip_all, fields(slug = %tenant.slug))]
    pub async fn register(&self, tenant: RegisterTenant, admin: RegisterAdmin) -> AuthResult<Tenant> {
        let name = validation::require_non_empty("name", &tenant.name)?;
        let slug = validation::require_slug(&tenant.slug)?;
        let email = validation::require_email("email", &admin.email)?;
        let first_name = validation::require_non_empty("first_name", &admin.first_name)?;
        let last_name = validation::require_non_empty("last_name", &admin.last_name)?;
        self.passwords.check_policy(&admin.password)?;
        let password_hash = self.passwords.hash_async(&admin.password).await?;

        let now = Utc::now();
        let mut new_tenant = Tenant::pending(&name, &slug, &email);
        new_tenant.verification_token = Some(crypto::random_token(VERIFICATION_TOKEN_BYTES));
        new_tenant.verification_token_expires_at = Some(now + self.verification_ttl);

        let tenant_id = new_tenant.id;
        let founder = User {
            id: Uuid::new_v4(),
            tenant_id,
            email: email.clone(),
            password_hash,
            first_name,
            last_name,
            status: UserStatus::Pending,
            email_verified: false,
            two_factor_enabled: false,
            two_factor_secret: None,
            two_factor_backup_codes: None,
            password_reset_token: None,
            password_reset_expires_at: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };

        let tenant = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let tenants = TenantRepository::new(&txn);
                if tenants.slug_exists(&new_tenant.slug).await? {
                    return Err(AuthError::Conflict("tenant slug already taken".into()));
                }
                let tenant = tenants.insert(new_tenant).await?;
                let founder = UserRepository::new(&txn).insert(founder).await?;

                AuditLogger::record_in(
                    &txn,
                    AuditEntry::success(tenant_id, actions::REGISTER, "tenants")
                        .user(founder.id)
                        .resource_id(tenant_id),
                )
                .await?;
                Ok::<_, AuthError>(tenant)
            })
            .await?;

        if let Some(token) = tenant.verification_token.as_deref() {
            let verify_url = format!("{}/verify-email?token={}", self.base_url, token);
            self.outbox.submit(OutboundEmail::new(
                tenant.email.clone(),
                templates::verification_email(&tenant.name, &verify_url),
            ));
        }

        info!(tenant_id = %tenant.id, "Tenant registered");
        Ok(tenant)
    }

    /// Consume a verification token: activate the tenant, provision its
    /// built-in roles and make the founding user an active owner.
    pub async fn verify_email(&self, token: &str) -> AuthResult<Tenant> {
        let lookup = token.to_string();
        let pending = self
            .gateway
            .run_with_bypass(|txn| async move {
                TenantRepository::new(&txn)
                    .find_by_verification_token(&lookup)
                    .await
            })
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let tenant_id = pending.id;
        let token = token.to_string();
        let tenant = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let tenants = TenantRepository::new(&txn);
                // A concurrent verification may have consumed the token
                let current = tenants
                    .find_by_id(tenant_id)
                    .await?
                    .filter(|t| t.verification_token.as_deref() == Some(token.as_str()))
                    .ok_or(AuthError::InvalidToken)?;

                tenants.mark_verified(current.id).await?;
                let roles = provision_system_roles(&txn, tenant_id).await?;
                let owner = roles
                    .iter()
                    .find(|role| role.name == OWNER_ROLE)
                    .ok_or_else(|| AuthError::Internal("owner role was not provisioned".into()))?;

                let users = UserRepository::new(&txn);
                let founder = users
                    .find_founding_user(tenant_id)
                    .await?
                    .ok_or_else(|| AuthError::Internal("tenant has no founding user".into()))?;
                users.activate(founder.id).await?;
                RoleRepository::new(&txn)
                    .replace_user_roles(tenant_id, founder.id, &[owner.id])
                    .await?;

                AuditLogger::record_in(
                    &txn,
                    AuditEntry::success(tenant_id, actions::EMAIL_VERIFIED, "tenants")
                        .user(founder.id)
                        .resource_id(tenant_id),
                )
                .await?;

                tenants
                    .find_by_id(tenant_id)
                    .await?
                    .ok_or_else(|| AuthError::NotFound("tenant not found".into()))
            })
            .await?;

        info!(tenant_id = %tenant_id, "Tenant email verified");
        Ok(tenant)
    }

    /// Check credentials and either issue tokens, ask for a second factor, or
    /// ask the client to pick a tenant.
    #[instrument(skip_all, fields(tenant_id = ?request.tenant_id))]
    pub async fn login(&self, request: LoginRequest) -> AuthResult<LoginOutcome> {
        let email = validation::normalize_email(&request.email);
        let scope_tenant = request.tenant_id;

        let candidates = self
            .gateway
            .run_with_bypass(|txn| async move {
                let users = UserRepository::new(&txn)
                    .find_all_by_email(&email)
                    .await?
                    .into_iter()
                    .filter(|u| scope_tenant.is_none_or(|id| u.tenant_id == id));

                let tenants = TenantRepository::new(&txn);
                let mut accounts = Vec::new();
                for user in users {
                    if let Some(tenant) = tenants.find_by_id(user.tenant_id).await? {
                        accounts.push((user, tenant));
                    }
                }
                Ok::<_, AuthError>(accounts)
            })
            .await?;

        if candidates.is_empty() {
            self.passwords.verify_decoy_async(&request.password).await;
            debug!("Login rejected: no matching account");
            return Err(AuthError::InvalidCredentials);
        }

        // Each tenant's password is authoritative for that tenant only
        let mut verified = Vec::with_capacity(candidates.len());
        for (user, tenant) in candidates {
            if self.passwords.verify_async(&request.password, &user.password_hash).await? {
                verified.push((user, tenant));
            } else {
                self.record_login_failure(&user, &request.device, "invalid_password")
                    .await;
            }
        }

        if verified.len() > 1 {
            let tenants = verified
                .into_iter()
                .map(|(_, tenant)| TenantChoice {
                    tenant_id: tenant.id,
                    slug: tenant.slug,
                    name: tenant.name,
                })
                .collect();
            return Ok(LoginOutcome::MultiTenantChoice { tenants });
        }

        let Some((user, tenant)) = verified.pop() else {
            return Err(AuthError::InvalidCredentials);
        };

        if !tenant.is_active() {
            self.record_login_failure(&user, &request.device, "tenant_inactive")
                .await;
            return Err(AuthError::InvalidCredentials);
        }
        if !user.can_login() {
            self.record_login_failure(&user, &request.device, "account_inactive")
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if user.two_factor_enabled {
            let trusted = match (&request.device_fingerprint, &request.device_token) {
                (Some(fp), Some(token)) => {
                    self.two_factor.is_trusted(user.id, tenant.id, fp, token).await?
                }
                _ => false,
            };

            if !trusted {
                let subject = subject_for(&user, &tenant, None);
                let challenge = self
                    .tokens
                    .issue_challenge_token(&subject, request.remember_me)?;
                debug!(tenant_id = %tenant.id, user_id = %user.id, "Two-factor challenge issued");
                return Ok(LoginOutcome::TwoFactorChallenge {
                    challenge_token: challenge.token,
                    expires_in: challenge.expires_in,
                });
            }
        }

        let tokens = self
            .establish_session(&user, &tenant, request.remember_me, request.device)
            .await?;
        Ok(LoginOutcome::Authenticated(tokens))
    }

    /// Second step of a 2FA login. Each challenge token completes at most once.
    pub async fn complete_two_factor(&self, completion: TwoFactorCompletion) -> AuthResult<AuthTokens> {
        let claims = self
            .tokens
            .validate(&completion.challenge_token, TokenKind::Challenge)?;
        let used_key = challenge_used_key(claims.jti);
        if self.cache.get(&used_key).await?.is_some() {
            return Err(AuthError::InvalidToken);
        }

        let (user, tenant) = self.load_account(claims.tenant_id, claims.sub).await?;
        if !tenant.is_active() || !user.can_login() || !user.two_factor_enabled {
            return Err(AuthError::InvalidToken);
        }

        let valid = self
            .two_factor
            .verify_any(user.id, tenant.id, &completion.code)
            .await?;
        if !valid {
            self.record_login_failure(&user, &completion.device, "invalid_second_factor")
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        let ttl = Duration::from_secs(self.tokens.lifetime(TokenKind::Challenge, false));
        let uses = self.cache.incr_with_expiry(&used_key, ttl).await?;
        if uses.value > 1 {
            return Err(AuthError::InvalidToken);
        }

        let trusted_device_token = match completion.trust_device.as_deref() {
            Some(device_fingerprint) => Some(
                self.two_factor
                    .remember_device(user.id, tenant.id, device_fingerprint)
                    .await?,
            ),
            None => None,
        };

        let mut tokens = self
            .establish_session(&user, &tenant, claims.remember_me, completion.device)
            .await?;
        tokens.trusted_device_token = trusted_device_token;
        Ok(tokens)
    }

    /// Issue a new access token for the refresh token's session. The refresh
    /// token itself is returned unchanged to the client (no rotation).
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<RefreshedToken> {
        let claims = self.tokens.validate(refresh_token, TokenKind::Refresh)?;
        let session_id = claims.sid.ok_or(AuthError::InvalidToken)?;

        let (user, tenant) = self.load_account(claims.tenant_id, claims.sub).await?;
        if !tenant.is_active() || !user.can_login() {
            debug!(user_id = %user.id, "Refresh rejected: account no longer active");
            return Err(AuthError::InvalidToken);
        }

        let session = self
            .sessions
            .find_by_id(tenant.id, session_id)
            .await
            .map_err(not_found_as_invalid_token)?;
        if session.user_id != user.id {
            return Err(AuthError::InvalidToken);
        }

        let subject = subject_for(&user, &tenant, Some(session_id));
        let access = self.tokens.issue_access_token(&subject, claims.remember_me)?;
        self.sessions
            .rotate_fingerprint(tenant.id, session_id, &fingerprint(&access.token))
            .await
            .map_err(not_found_as_invalid_token)?;

        debug!(tenant_id = %tenant.id, session_id = %session_id, "Access token refreshed");
        Ok(RefreshedToken {
            access_token: access.token,
            token_type: "Bearer",
            expires_in: access.expires_in,
        })
    }

    /// End the session bound to `token_fingerprint`. Unknown sessions are not
    /// an error.
    pub async fn logout(&self, tenant_id: Uuid, token_fingerprint: &str) -> AuthResult<()> {
        let owner = match self
            .sessions
            .find_by_fingerprint(tenant_id, token_fingerprint)
            .await
        {
            Ok(session) => Some(session.user_id),
            Err(AuthError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let removed = self
            .sessions
            .revoke_by_fingerprint(tenant_id, token_fingerprint)
            .await?;

        if let Some(user_id) = owner {
            self.audit
                .record(AuditEntry::success(tenant_id, actions::LOGOUT, "sessions").user(user_id))
                .await;
        }
        debug!(tenant_id = %tenant_id, removed, "Logged out");
        Ok(())
    }

    pub async fn logout_all(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<u64> {
        let removed = self.sessions.revoke_all_for_user(tenant_id, user_id).await?;
        self.audit
            .record(
                AuditEntry::success(tenant_id, actions::LOGOUT_ALL, "sessions")
                    .user(user_id)
                    .metadata(json!({ "sessions_removed": removed })),
            )
            .await;
        Ok(removed)
    }

    /// Always succeeds for well-formed input so callers cannot probe which
    /// emails exist. A reset link is sent only when the user does.
    pub async fn request_password_reset(&self, tenant_id: Uuid, email: &str) -> AuthResult<()> {
        let email = validation::require_email("email", email)?;
        let token = crypto::random_token(RESET_TOKEN_BYTES);
        let expires_at = Utc::now() + self.reset_ttl;

        let issued = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let users = UserRepository::new(&txn);
                let Some(user) = users.find_by_email(&email).await? else {
                    return Ok(None);
                };
                if matches!(user.status, UserStatus::Suspended | UserStatus::Deactivated) {
                    return Ok(None);
                }
                users.set_reset_token(user.id, &token, expires_at).await?;
                Ok::<_, AuthError>(Some((user, token)))
            })
            .await?;

        match issued {
            Some((user, token)) => {
                let reset_url = format!(
                    "{}/reset-password?token={}&tenant={}",
                    self.base_url, token, tenant_id
                );
                let ttl_minutes = (self.reset_ttl.num_seconds().max(60) / 60) as u64;
                self.outbox.submit(OutboundEmail::new(
                    user.email.clone(),
                    templates::password_reset_email(&reset_url, ttl_minutes),
                ));
                info!(tenant_id = %tenant_id, user_id = %user.id, "Password reset issued");
            }
            None => debug!(tenant_id = %tenant_id, "Password reset requested for unknown account"),
        }
        Ok(())
    }

    /// Set a new password from a reset token. Every session of the user is
    /// revoked in the same transaction.
    pub async fn reset_password(
        &self,
        tenant_id: Uuid,
        token: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        self.passwords.check_policy(new_password)?;
        let password_hash = self.passwords.hash_async(new_password).await?;
        let token = token.to_string();

        let (user_id, revoked) = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let users = UserRepository::new(&txn);
                let user = users
                    .find_by_reset_token(&token)
                    .await?
                    .ok_or(AuthError::InvalidToken)?;

                users.update_password(user.id, &password_hash).await?;
                let revoked = SessionRepository::new(&txn)
                    .delete_for_user(user.id, None)
                    .await?;

                AuditLogger::record_in(
                    &txn,
                    AuditEntry::success(tenant_id, actions::PASSWORD_RESET, "users")
                        .user(user.id)
                        .resource_id(user.id)
                        .metadata(json!({ "sessions_revoked": revoked })),
                )
                .await?;
                Ok::<_, AuthError>((user.id, revoked))
            })
            .await?;

        info!(tenant_id = %tenant_id, user_id = %user_id, revoked, "Password reset completed");
        Ok(())
    }

    /// Change a password after re-proving the current one. Other sessions
    /// stay valid.
    pub async fn change_password(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        self.passwords.check_policy(new_password)?;
        if current_password == new_password {
            return Err(AuthError::validation(
                "new_password",
                "must differ from the current password",
            ));
        }

        let (user, _) = self.load_account(tenant_id, user_id).await?;
        if !self.passwords.verify_async(current_password, &user.password_hash).await? {
            self.audit
                .record(
                    AuditEntry::failure(tenant_id, actions::PASSWORD_CHANGE, "users").user(user_id),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        let password_hash = self.passwords.hash_async(new_password).await?;
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                UserRepository::new(&txn)
                    .update_password(user_id, &password_hash)
                    .await?;
                AuditLogger::record_in(
                    &txn,
                    AuditEntry::success(tenant_id, actions::PASSWORD_CHANGE, "users")
                        .user(user_id)
                        .resource_id(user_id),
                )
                .await
            })
            .await?;

        info!(tenant_id = %tenant_id, user_id = %user_id, "Password changed");
        Ok(())
    }

    /// Setup material for a user who has not enabled 2FA yet.
    pub async fn begin_two_factor_setup(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AuthResult<TwoFactorSetup> {
        let (user, _) = self.load_account(tenant_id, user_id).await?;
        if user.two_factor_enabled {
            return Err(AuthError::Conflict(
                "two-factor authentication already enabled".into(),
            ));
        }
        self.two_factor.generate_setup(&user.email)
    }

    pub async fn enable_two_factor(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        secret: &str,
        code: &str,
        backup_codes: &[String],
    ) -> AuthResult<()> {
        self.two_factor
            .enable(user_id, tenant_id, secret, code, backup_codes)
            .await?;

        self.audit
            .record(
                AuditEntry::success(tenant_id, actions::TWO_FACTOR_ENABLE, "users").user(user_id),
            )
            .await;

        match self.load_account(tenant_id, user_id).await {
            Ok((user, _)) => self.outbox.submit(OutboundEmail::new(
                user.email.clone(),
                templates::two_factor_enabled_email(&user.full_name()),
            )),
            Err(err) => warn!(error = %err, "Failed to load user for 2FA notice"),
        }
        Ok(())
    }

    /// Turn 2FA off after re-proving the password.
    pub async fn disable_two_factor(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        password: &str,
    ) -> AuthResult<()> {
        let (user, _) = self.load_account(tenant_id, user_id).await?;
        if !self.passwords.verify_async(password, &user.password_hash).await? {
            self.audit
                .record(
                    AuditEntry::failure(tenant_id, actions::TWO_FACTOR_DISABLE, "users")
                        .user(user_id),
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        self.two_factor.disable(user_id, tenant_id).await?;
        self.audit
            .record(
                AuditEntry::success(tenant_id, actions::TWO_FACTOR_DISABLE, "users").user(user_id),
            )
            .await;
        Ok(())
    }

    async fn establish_session(
        &self,
        user: &User,
        tenant: &Tenant,
        remember_me: bool,
        device: DeviceInfo,
    ) -> AuthResult<AuthTokens> {
        let session_id = Uuid::new_v4();
        let subject = subject_for(user, tenant, Some(session_id));
        let access = self.tokens.issue_access_token(&subject, remember_me)?;
        let refresh = self.tokens.issue_refresh_token(&subject, remember_me)?;

        let audit_entry = AuditEntry::success(tenant.id, actions::LOGIN, "sessions")
            .user(user.id)
            .resource_id(session_id)
            .device(&device)
            .metadata(json!({ "remember_me": remember_me }));

        self.sessions
            .create(
                NewSession::new(
                    user.id,
                    tenant.id,
                    fingerprint(&access.token),
                    device,
                    self.sessions.expiry_for(remember_me),
                )
                .with_id(session_id)
                .remember_me(remember_me),
            )
            .await?;

        let user_id = user.id;
        let last_login = self
            .gateway
            .run_in_tenant_context(tenant.id, |txn| async move {
                UserRepository::new(&txn).update_last_login(user_id).await
            })
            .await;
        if let Err(err) = last_login {
            warn!(user_id = %user_id, error = %err, "Failed to record last login");
        }

        self.audit.record(audit_entry).await;
        info!(tenant_id = %tenant.id, user_id = %user.id, session_id = %session_id, "Login succeeded");

        Ok(AuthTokens {
            access_token: access.token,
            refresh_token: refresh.token,
            token_type: "Bearer",
            expires_in: access.expires_in,
            session_id,
            user_id: user.id,
            tenant_id: tenant.id,
            trusted_device_token: None,
        })
    }

    async fn load_account(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<(User, Tenant)> {
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                let user = UserRepository::new(&txn)
                    .find_by_id(user_id)
                    .await?
                    .ok_or(AuthError::InvalidToken)?;
                let tenant = TenantRepository::new(&txn)
                    .find_by_id(tenant_id)
                    .await?
                    .ok_or(AuthError::InvalidToken)?;
                Ok::<_, AuthError>((user, tenant))
            })
            .await
    }

    async fn record_login_failure(&self, user: &User, device: &DeviceInfo, reason: &str) {
        debug!(tenant_id = %user.tenant_id, user_id = %user.id, reason, "Login rejected");
        self.audit
            .record(
                AuditEntry::failure(user.tenant_id, actions::LOGIN, "sessions")
                    .user(user.id)
                    .device(device)
                    .metadata(json!({ "reason": reason })),
            )
            .await;
    }
}

fn subject_for(user: &User, tenant: &Tenant, session_id: Option<Uuid>) -> TokenSubject {
    TokenSubject {
        user_id: user.id,
        tenant_id: tenant.id,
        tenant_slug: tenant.slug.clone(),
        email: user.email.clone(),
        session_id,
    }
}

fn not_found_as_invalid_token(err: AuthError) -> AuthError {
    match err {
        AuthError::NotFound(_) => AuthError::InvalidToken,
        other => other,
    }
}
