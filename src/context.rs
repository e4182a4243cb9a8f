//! Wiring of every component of the authentication core over one database
//! connection, one cache backend and one mail outbox.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::audit::AuditLogger;
use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::credentials::{PasswordHasher, TokenEngine};
use crate::error::AuthResult;
use crate::gateway::TransactionGateway;
use crate::invitations::InvitationService;
use crate::mail::MailOutbox;
use crate::orchestrator::{AuthOrchestrator, OrchestratorSettings};
use crate::rbac::{PermissionResolver, RoleManager};
use crate::sessions::SessionStore;
use crate::two_factor::TwoFactorEngine;

/// Shared handles to the core's services. Cheap to clone.
#[derive(Clone)]
pub struct AuthContext {
    pub config: Arc<AppConfig>,
    pub gateway: TransactionGateway,
    pub tokens: TokenEngine,
    pub passwords: PasswordHasher,
    pub sessions: SessionStore,
    pub two_factor: TwoFactorEngine,
    pub permissions: PermissionResolver,
    pub roles: RoleManager,
    pub invitations: InvitationService,
    pub audit: AuditLogger,
    pub outbox: MailOutbox,
    pub cache: Arc<dyn CacheStore>,
    pub orchestrator: AuthOrchestrator,
}

impl AuthContext {
    pub fn build(
        config: AppConfig,
        db: DatabaseConnection,
        cache: Arc<dyn CacheStore>,
        outbox: MailOutbox,
    ) -> AuthResult<Self> {
        let gateway = TransactionGateway::new(db);
        let tokens = TokenEngine::new(&config.jwt);
        let passwords = PasswordHasher::new(&config.password)?;
        let sessions = SessionStore::new(gateway.clone(), config.session.clone());
        let two_factor =
            TwoFactorEngine::new(gateway.clone(), Arc::clone(&cache), config.two_factor.clone())?;
        let permissions = PermissionResolver::new(
            gateway.clone(),
            Arc::clone(&cache),
            Duration::from_secs(config.permission_cache_ttl_seconds),
        );
        let roles = RoleManager::new(gateway.clone(), permissions.clone());
        let invitations = InvitationService::new(
            gateway.clone(),
            passwords.clone(),
            outbox.clone(),
            config.invitation_ttl_seconds,
            config.app_base_url.clone(),
        );
        let audit = AuditLogger::new(gateway.clone());

        let orchestrator = AuthOrchestrator::new(
            gateway.clone(),
            tokens.clone(),
            passwords.clone(),
            sessions.clone(),
            two_factor.clone(),
            audit.clone(),
            outbox.clone(),
            Arc::clone(&cache),
            OrchestratorSettings {
                base_url: config.app_base_url.clone(),
                verification_ttl_seconds: config.verification_token_ttl_seconds,
                reset_ttl_seconds: config.password.reset_ttl_seconds,
            },
        );

        Ok(Self {
            config: Arc::new(config),
            gateway,
            tokens,
            passwords,
            sessions,
            two_factor,
            permissions,
            roles,
            invitations,
            audit,
            outbox,
            cache,
            orchestrator,
        })
    }
}
