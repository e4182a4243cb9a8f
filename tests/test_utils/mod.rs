//! Test utilities for the authentication core.
//!
//! Builds an [`AuthContext`] over an in-memory SQLite database with all
//! migrations applied and the permission catalog seeded, plus a mailer that
//! records outgoing messages so flows can pick tokens out of them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use regex::Regex;
use sea_orm::{Database, DatabaseConnection};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use tenant_auth::{
    AuthContext, AuthError,
    cache::MemoryCache,
    config::AppConfig,
    mail::{EmailSender, MailError, MailOutbox},
    models::{tenant::Model as Tenant, user::Model as User},
    orchestrator::{AuthTokens, LoginOutcome, LoginRequest, RegisterAdmin, RegisterTenant},
    repositories::UserRepository,
    seeds::seed_permissions,
};

pub const PASSWORD: &str = "Sup3r-Secret!";

/// A message captured by [`RecordingMailer`].
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        self.sent.lock().await.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html_body: html_body.to_string(),
        });
        Ok(())
    }
}

pub struct TestApp {
    pub ctx: AuthContext,
    pub db: DatabaseConnection,
    pub cache: Arc<MemoryCache>,
    pub mailer: Arc<RecordingMailer>,
    pub shutdown: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Configuration with development secrets and a cheap hash cost.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        app_base_url: "https://erp.test".to_string(),
        cache_capacity: 10_000,
        ..AppConfig::default()
    };
    config.jwt.access_secret = "test-access-secret".to_string();
    config.jwt.refresh_secret = "test-refresh-secret".to_string();
    config.password.hash_memory_kib = 64;
    config.password.hash_iterations = 1;
    config.two_factor.encryption_key = Some(vec![7u8; 32]);
    config
}

/// Sets up an in-memory SQLite database with all migrations applied and the
/// permission catalog seeded.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    seed_permissions(&db).await?;
    Ok(db)
}

pub async fn spawn_app() -> Result<TestApp> {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: AppConfig) -> Result<TestApp> {
    config.validate()?;
    let db = setup_test_db().await?;
    let cache = Arc::new(MemoryCache::new(config.cache_capacity));
    let mailer = Arc::new(RecordingMailer::default());
    let shutdown = CancellationToken::new();
    let (outbox, _worker) = MailOutbox::start(mailer.clone(), shutdown.clone());

    let ctx = AuthContext::build(config, db.clone(), cache.clone(), outbox)?;
    Ok(TestApp {
        ctx,
        db,
        cache,
        mailer,
        shutdown,
    })
}

impl TestApp {
    /// Delivered messages to `to` whose subject contains `subject`, oldest first.
    pub async fn mails(&self, to: &str, subject: &str) -> Vec<SentMail> {
        self.mailer
            .sent()
            .await
            .into_iter()
            .filter(|m| m.to == to && m.subject.contains(subject))
            .collect()
    }

    /// Wait for the `n`th (zero-based) matching message.
    pub async fn wait_for_nth_mail(&self, to: &str, subject: &str, n: usize) -> Result<SentMail> {
        for _ in 0..200 {
            if let Some(mail) = self.mails(to, subject).await.into_iter().nth(n) {
                return Ok(mail);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(anyhow!("mail #{n} to {to} with subject containing '{subject}' never arrived"))
    }

    /// Wait for the first matching message.
    pub async fn wait_for_mail(&self, to: &str, subject: &str) -> Result<SentMail> {
        self.wait_for_nth_mail(to, subject, 0).await
    }

    /// Register and verify a tenant; returns it with its founding owner.
    pub async fn verified_tenant(&self, slug: &str, email: &str) -> Result<(Tenant, User)> {
        let earlier = self.mails(email, "Verify").await.len();
        self.ctx
            .orchestrator
            .register(
                RegisterTenant {
                    name: format!("{slug} Inc"),
                    slug: slug.to_string(),
                },
                RegisterAdmin {
                    email: email.to_string(),
                    password: PASSWORD.to_string(),
                    first_name: "Ada".to_string(),
                    last_name: "Owner".to_string(),
                },
            )
            .await?;

        let mail = self.wait_for_nth_mail(email, "Verify", earlier).await?;
        let tenant = self
            .ctx
            .orchestrator
            .verify_email(&token_from(&mail.html_body)?)
            .await?;
        let user = self.user_by_email(tenant.id, email).await?;
        Ok((tenant, user))
    }

    pub async fn user_by_email(&self, tenant_id: Uuid, email: &str) -> Result<User> {
        let email = email.to_string();
        let user = self
            .ctx
            .gateway
            .run_read_only(tenant_id, |txn| async move {
                UserRepository::new(&txn).find_by_email(&email).await
            })
            .await?
            .ok_or_else(|| anyhow!("user not found"))?;
        Ok(user)
    }

    pub async fn user(&self, tenant_id: Uuid, user_id: Uuid) -> Result<User> {
        Ok(self
            .ctx
            .gateway
            .run_read_only(tenant_id, |txn| async move {
                UserRepository::new(&txn).get(user_id).await
            })
            .await?)
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<LoginOutcome, AuthError> {
        self.ctx
            .orchestrator
            .login(LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
                tenant_id,
                ..LoginRequest::default()
            })
            .await
    }

    /// Log in and expect tokens straight away.
    pub async fn login_tokens(&self, email: &str, tenant_id: Uuid) -> Result<AuthTokens> {
        match self.login(email, PASSWORD, Some(tenant_id)).await? {
            LoginOutcome::Authenticated(tokens) => Ok(tokens),
            other => Err(anyhow!("expected tokens, got {other:?}")),
        }
    }
}

/// The `token` query parameter of the first link in an email body.
pub fn token_from(html_body: &str) -> Result<String> {
    let re = Regex::new(r"token=([A-Za-z0-9_-]+)")?;
    re.captures(html_body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("no token in email body"))
}

/// Current TOTP code for a base32 secret.
pub fn totp_now(secret_base32: &str) -> Result<String> {
    let bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow!("bad secret: {e:?}"))?;
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        bytes,
        Some("Tenant Auth".to_string()),
        "test".to_string(),
    )?;
    Ok(totp.generate_current()?)
}
