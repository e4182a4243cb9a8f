//! # Invitations
//!
//! Offers to join a tenant with a predetermined role set. Creating an
//! invitation revokes any pending one for the same email, so at most one is
//! pending per (tenant, email). Tokens are single use.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, actions};
use crate::credentials::PasswordHasher;
use crate::crypto;
use crate::error::{AuthError, AuthResult};
use crate::gateway::TransactionGateway;
use crate::mail::{MailOutbox, OutboundEmail, templates};
use crate::models::invitation::{InvitationStatus, Model as Invitation};
use crate::models::user::{Model as User, UserStatus};
use crate::repositories::{InvitationRepository, RoleRepository, TenantRepository, UserRepository};
use crate::validation;

const INVITATION_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct AcceptInvitation {
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

#[derive(Clone)]
pub struct InvitationService {
    gateway: TransactionGateway,
    passwords: PasswordHasher,
    outbox: MailOutbox,
    ttl: Duration,
    base_url: String,
}

impl InvitationService {
    pub fn new(
        gateway: TransactionGateway,
        passwords: PasswordHasher,
        outbox: MailOutbox,
        ttl_seconds: u64,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            passwords,
            outbox,
            ttl: Duration::seconds(ttl_seconds as i64),
            base_url: base_url.into(),
        }
    }

    pub async fn create(
        &self,
        tenant_id: Uuid,
        invited_by: Option<Uuid>,
        email: &str,
        role_ids: &[Uuid],
    ) -> AuthResult<Invitation> {
        let email = validation::require_email("email", email)?;
        if role_ids.is_empty() {
            return Err(AuthError::validation("role_ids", "at least one role is required"));
        }

        let mut role_ids = role_ids.to_vec();
        role_ids.sort();
        role_ids.dedup();

        let now = Utc::now();
        let model = Invitation {
            id: Uuid::new_v4(),
            tenant_id,
            email: email.clone(),
            role_ids: serde_json::to_string(&role_ids)
                .map_err(|e| AuthError::internal("failed to encode role ids", e))?,
            token: crypto::random_token(INVITATION_TOKEN_BYTES),
            status: InvitationStatus::Pending,
            invited_by,
            expires_at: now + self.ttl,
            accepted_at: None,
            created_at: now,
            updated_at: now,
        };

        let (invitation, tenant_name) = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let tenant = TenantRepository::new(&txn)
                    .find_by_id(tenant_id)
                    .await?
                    .ok_or_else(|| AuthError::NotFound("tenant not found".into()))?;

                if UserRepository::new(&txn).find_by_email(&email).await?.is_some() {
                    return Err(AuthError::Conflict(
                        "a user with this email already exists".into(),
                    ));
                }

                let found = RoleRepository::new(&txn).find_many(&role_ids).await?;
                if found.len() != role_ids.len() {
                    return Err(AuthError::validation("role_ids", "unknown role"));
                }

                let invitations = InvitationRepository::new(&txn);
                let revoked = invitations.revoke_pending_for_email(tenant_id, &email).await?;
                let invitation = invitations.insert(model).await?;

                let mut entry =
                    AuditEntry::success(tenant_id, actions::INVITATION_CREATE, "invitations")
                        .resource_id(invitation.id)
                        .metadata(json!({ "email": email, "replaced": revoked }));
                if let Some(inviter) = invited_by {
                    entry = entry.user(inviter);
                }
                AuditLogger::record_in(&txn, entry).await?;

                Ok::<_, AuthError>((invitation, tenant.name))
            })
            .await?;

        let accept_url = format!(
            "{}/accept-invitation?token={}",
            self.base_url.trim_end_matches('/'),
            invitation.token
        );
        self.outbox.submit(OutboundEmail::new(
            invitation.email.clone(),
            templates::invitation_email(&tenant_name, &accept_url),
        ));

        info!(tenant_id = %tenant_id, invitation_id = %invitation.id, "Invitation created");
        Ok(invitation)
    }

    /// Resolve a pending, unexpired invitation from its token. Runs under
    /// bypass because the tenant is not known yet.
    pub async fn lookup_by_token(&self, token: &str) -> AuthResult<Invitation> {
        let token = token.to_string();
        let invitation = self
            .gateway
            .run_with_bypass(|txn| async move {
                InvitationRepository::new(&txn).find_by_token(&token).await
            })
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if invitation.status != InvitationStatus::Pending || invitation.expires_at <= Utc::now() {
            return Err(AuthError::InvalidToken);
        }
        Ok(invitation)
    }

    /// Create an active, verified user with the invitation's roles.
    pub async fn accept(&self, token: &str, request: AcceptInvitation) -> AuthResult<User> {
        let first_name = validation::require_non_empty("first_name", &request.first_name)?;
        let last_name = validation::require_non_empty("last_name", &request.last_name)?;
        self.passwords.check_policy(&request.password)?;

        let invitation = self.lookup_by_token(token).await?;
        let role_ids = invitation
            .role_ids()
            .map_err(|e| AuthError::internal("stored invitation roles are corrupt", e))?;
        let password_hash = self.passwords.hash_async(&request.password).await?;

        let tenant_id = invitation.tenant_id;
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            email: invitation.email.clone(),
            password_hash,
            first_name,
            last_name,
            status: UserStatus::Active,
            email_verified: true,
            two_factor_enabled: false,
            two_factor_secret: None,
            two_factor_backup_codes: None,
            password_reset_token: None,
            password_reset_expires_at: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };

        let user = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                InvitationRepository::new(&txn)
                    .transition(invitation.id, InvitationStatus::Accepted)
                    .await?;

                let user = UserRepository::new(&txn).insert(user).await?;

                // Roles deleted since the invitation was sent are skipped
                let roles = RoleRepository::new(&txn);
                let existing: Vec<Uuid> = roles
                    .find_many(&role_ids)
                    .await?
                    .into_iter()
                    .map(|role| role.id)
                    .collect();
                roles.replace_user_roles(tenant_id, user.id, &existing).await?;

                AuditLogger::record_in(
                    &txn,
                    AuditEntry::success(tenant_id, actions::INVITATION_ACCEPT, "invitations")
                        .user(user.id)
                        .resource_id(invitation.id),
                )
                .await?;
                Ok::<_, AuthError>(user)
            })
            .await?;

        info!(tenant_id = %tenant_id, user_id = %user.id, "Invitation accepted");
        Ok(user)
    }

    pub async fn revoke(
        &self,
        tenant_id: Uuid,
        invitation_id: Uuid,
        revoked_by: Option<Uuid>,
    ) -> AuthResult<()> {
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let invitations = InvitationRepository::new(&txn);
                if invitations.find_by_id(invitation_id).await?.is_none() {
                    return Err(AuthError::NotFound("invitation not found".into()));
                }
                invitations
                    .transition(invitation_id, InvitationStatus::Revoked)
                    .await?;

                let mut entry =
                    AuditEntry::success(tenant_id, actions::INVITATION_REVOKE, "invitations")
                        .resource_id(invitation_id);
                if let Some(user_id) = revoked_by {
                    entry = entry.user(user_id);
                }
                AuditLogger::record_in(&txn, entry).await
            })
            .await
    }

    pub async fn list_pending(&self, tenant_id: Uuid) -> AuthResult<Vec<Invitation>> {
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                InvitationRepository::new(&txn).list_pending(tenant_id).await
            })
            .await
    }

    /// Mark overdue pending invitations expired, across all tenants.
    pub async fn sweep_expired(&self) -> AuthResult<u64> {
        let expired = self
            .gateway
            .run_with_bypass(|txn| async move {
                InvitationRepository::new(&txn).expire_overdue(Utc::now()).await
            })
            .await?;
        if expired > 0 {
            info!(expired, "Expired overdue invitations");
        }
        Ok(expired)
    }
}
