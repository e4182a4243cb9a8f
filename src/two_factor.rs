//! # Two-Factor Engine
//!
//! TOTP (SHA1, 6 digits, 30 second step, one step of drift either way),
//! single-use backup codes and trusted devices.
//!
//! Per-user state moves `disabled -> pending_setup -> enabled -> disabled`.
//! `pending_setup` is not persisted: [`TwoFactorEngine::generate_setup`] hands
//! the material to the caller and nothing is stored until
//! [`TwoFactorEngine::enable`] proves the authenticator works.
//!
//! Secrets and each backup code are encrypted independently at rest. Attempt
//! counters and trusted devices live in the cache backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::TwoFactorConfig;
use crate::crypto::{self, CryptoKey, FieldPurpose};
use crate::error::{AuthError, AuthResult};
use crate::gateway::TransactionGateway;
use crate::models::user::Model as User;
use crate::repositories::UserRepository;
use crate::repositories::user::TwoFactorColumns;

pub const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;
const DEVICE_TOKEN_BYTES: usize = 32;

/// Material shown to the user while setting up an authenticator.
#[derive(Debug, Clone, Serialize)]
pub struct TwoFactorSetup {
    /// Base32 TOTP seed
    pub secret: String,
    pub provisioning_uri: String,
    /// PNG QR code, base64-encoded
    pub qr_image: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub backup_codes_remaining: usize,
}

pub fn attempts_key(tenant_id: Uuid, user_id: Uuid) -> String {
    format!("2fa_attempts:{tenant_id}:{user_id}")
}

pub fn trusted_device_key(tenant_id: Uuid, user_id: Uuid, fingerprint: &str) -> String {
    format!("trusted_device:{tenant_id}:{user_id}:{fingerprint}")
}

fn totp(secret_base32: &str, issuer: &str, account: &str) -> AuthResult<TOTP> {
    let bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| AuthError::validation("secret", format!("invalid TOTP secret: {e:?}")))?;

    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        bytes,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| AuthError::internal("failed to build TOTP", e))
}

/// Check `code` against `secret_base32` at unix time `at`, tolerating one step
/// of clock drift.
pub fn verify_totp(secret_base32: &str, code: &str, at: u64) -> AuthResult<bool> {
    let code = code.trim();
    if code.len() != TOTP_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    let totp = totp(secret_base32, "verify", "verify")?;
    Ok(totp.check(code, at))
}

/// Strip spaces and hyphens, uppercase.
pub fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Ten codes formatted `XXXX-XXXX`.
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let raw: String = (0..8)
                .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())] as char)
                .collect();
            format!("{}-{}", &raw[..4], &raw[4..])
        })
        .collect()
}

fn is_totp_shaped(code: &str) -> bool {
    let code = code.trim();
    code.len() == TOTP_DIGITS && code.chars().all(|c| c.is_ascii_digit())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct TwoFactorEngine {
    gateway: TransactionGateway,
    cache: Arc<dyn CacheStore>,
    key: CryptoKey,
    config: TwoFactorConfig,
}

impl TwoFactorEngine {
    pub fn new(
        gateway: TransactionGateway,
        cache: Arc<dyn CacheStore>,
        config: TwoFactorConfig,
    ) -> AuthResult<Self> {
        let key_bytes = config
            .encryption_key
            .clone()
            .ok_or_else(|| AuthError::Internal("two-factor encryption key missing".into()))?;
        let key = CryptoKey::new(key_bytes)?;

        Ok(Self {
            gateway,
            cache,
            key,
            config,
        })
    }

    /// Fresh seed, provisioning URI, QR image and backup codes. Nothing is
    /// persisted.
    pub fn generate_setup(&self, email: &str) -> AuthResult<TwoFactorSetup> {
        let secret = match Secret::generate_secret().to_encoded() {
            Secret::Encoded(encoded) => encoded,
            Secret::Raw(_) => {
                return Err(AuthError::Internal("TOTP secret encoding failed".into()));
            }
        };

        let totp = totp(&secret, &self.config.totp_issuer, email)?;
        let qr_image = totp
            .get_qr_base64()
            .map_err(|e| AuthError::internal("failed to render QR code", e))?;

        Ok(TwoFactorSetup {
            provisioning_uri: totp.get_url(),
            secret,
            qr_image,
            backup_codes: generate_backup_codes(),
        })
    }

    /// Persist the secret and backup codes once `code` proves the
    /// authenticator. On a wrong code nothing is written.
    pub async fn enable(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        secret: &str,
        code: &str,
        backup_codes: &[String],
    ) -> AuthResult<()> {
        if !verify_totp(secret, code, unix_now())? {
            return Err(AuthError::validation("code", "verification code is incorrect"));
        }
        if backup_codes.len() != BACKUP_CODE_COUNT {
            return Err(AuthError::validation(
                "backup_codes",
                format!("expected {BACKUP_CODE_COUNT} backup codes"),
            ));
        }

        let columns = TwoFactorColumns {
            enabled: true,
            secret: Some(self.encrypt_secret(tenant_id, user_id, secret)?),
            backup_codes: Some(self.encrypt_backup_codes(tenant_id, user_id, backup_codes)?),
        };

        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let users = UserRepository::new(&txn);
                let user = users.get_for_update(user_id).await?;
                if user.two_factor_enabled {
                    return Err(AuthError::Conflict(
                        "two-factor authentication already enabled".into(),
                    ));
                }
                users.set_two_factor(user_id, columns).await
            })
            .await?;

        info!(tenant_id = %tenant_id, user_id = %user_id, "Two-factor authentication enabled");
        Ok(())
    }

    /// Verify a TOTP code. Rate limited per (tenant, user); a success resets
    /// the window.
    pub async fn verify_code(&self, user_id: Uuid, tenant_id: Uuid, code: &str) -> AuthResult<bool> {
        self.register_attempt(tenant_id, user_id).await?;

        let user = self.load_user(tenant_id, user_id).await?;
        let Some(encrypted) = user.two_factor_secret.as_deref().filter(|_| user.two_factor_enabled)
        else {
            return Ok(false);
        };

        let secret = crypto::decrypt_field(
            &self.key,
            &crypto::field_aad(tenant_id, user_id, FieldPurpose::TotpSecret),
            encrypted,
        )?;

        let valid = verify_totp(&secret, code, unix_now())?;
        if valid {
            self.reset_attempts(tenant_id, user_id).await;
        } else {
            debug!(tenant_id = %tenant_id, user_id = %user_id, "TOTP code rejected");
        }
        Ok(valid)
    }

    /// Verify and burn one backup code. Shares the TOTP attempt limit.
    pub async fn verify_and_consume_backup_code(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        code: &str,
    ) -> AuthResult<bool> {
        self.register_attempt(tenant_id, user_id).await?;

        let submitted = normalize_backup_code(code);
        if submitted.is_empty() {
            return Ok(false);
        }

        let engine = self.clone();
        let consumed = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let users = UserRepository::new(&txn);
                let user = users.get_for_update(user_id).await?;
                let mut codes = engine.decrypt_backup_codes(&user)?;

                let Some(index) = codes.iter().position(|stored| {
                    bool::from(normalize_backup_code(stored).as_bytes().ct_eq(submitted.as_bytes()))
                }) else {
                    return Ok(None);
                };

                codes.remove(index);
                let encoded = engine.encrypt_backup_codes(tenant_id, user_id, &codes)?;
                users.set_backup_codes(user_id, Some(encoded)).await?;
                Ok::<_, AuthError>(Some(codes.len()))
            })
            .await?;

        match consumed {
            Some(remaining) => {
                info!(
                    tenant_id = %tenant_id,
                    user_id = %user_id,
                    remaining,
                    "Backup code consumed"
                );
                self.reset_attempts(tenant_id, user_id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// TOTP when the input looks like one, backup code otherwise.
    pub async fn verify_any(&self, user_id: Uuid, tenant_id: Uuid, code: &str) -> AuthResult<bool> {
        if is_totp_shaped(code) {
            self.verify_code(user_id, tenant_id, code).await
        } else {
            self.verify_and_consume_backup_code(user_id, tenant_id, code)
                .await
        }
    }

    /// Clear the secret and backup codes and forget every trusted device.
    pub async fn disable(&self, user_id: Uuid, tenant_id: Uuid) -> AuthResult<()> {
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                UserRepository::new(&txn)
                    .set_two_factor(user_id, TwoFactorColumns::default())
                    .await
            })
            .await?;

        let pattern = format!("trusted_device:{tenant_id}:{user_id}:*");
        let forgotten = self.cache.delete_pattern(&pattern).await?;
        self.reset_attempts(tenant_id, user_id).await;

        info!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            trusted_devices_removed = forgotten,
            "Two-factor authentication disabled"
        );
        Ok(())
    }

    pub async fn status(&self, user_id: Uuid, tenant_id: Uuid) -> AuthResult<TwoFactorStatus> {
        let user = self.load_user(tenant_id, user_id).await?;
        let backup_codes_remaining = match user.two_factor_backup_codes.as_deref() {
            Some(encoded) => serde_json::from_str::<Vec<String>>(encoded)
                .map(|codes| codes.len())
                .map_err(|e| AuthError::internal("stored backup codes are corrupt", e))?,
            None => 0,
        };

        Ok(TwoFactorStatus {
            enabled: user.two_factor_enabled,
            backup_codes_remaining,
        })
    }

    /// Replace every backup code after re-proving possession of the
    /// authenticator.
    pub async fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        code: &str,
    ) -> AuthResult<Vec<String>> {
        if !self.verify_code(user_id, tenant_id, code).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let codes = generate_backup_codes();
        let encoded = self.encrypt_backup_codes(tenant_id, user_id, &codes)?;
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                UserRepository::new(&txn)
                    .set_backup_codes(user_id, Some(encoded))
                    .await
            })
            .await?;

        info!(tenant_id = %tenant_id, user_id = %user_id, "Backup codes regenerated");
        Ok(codes)
    }

    /// Trust `device_fingerprint` for the configured period. The returned
    /// token must accompany the fingerprint on later logins.
    pub async fn remember_device(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        device_fingerprint: &str,
    ) -> AuthResult<String> {
        let token = crypto::random_token(DEVICE_TOKEN_BYTES);
        self.cache
            .set_with_ttl(
                &trusted_device_key(tenant_id, user_id, device_fingerprint),
                &token,
                Duration::from_secs(self.config.trusted_device_ttl_seconds),
            )
            .await?;
        Ok(token)
    }

    pub async fn is_trusted(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        device_fingerprint: &str,
        device_token: &str,
    ) -> AuthResult<bool> {
        let stored = self
            .cache
            .get(&trusted_device_key(tenant_id, user_id, device_fingerprint))
            .await?;

        Ok(stored.is_some_and(|stored| {
            bool::from(stored.as_bytes().ct_eq(device_token.as_bytes()))
        }))
    }

    async fn register_attempt(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<()> {
        let counter = self
            .cache
            .incr_with_expiry(
                &attempts_key(tenant_id, user_id),
                Duration::from_secs(self.config.window_seconds),
            )
            .await?;

        if counter.value > u64::from(self.config.max_attempts) {
            warn!(
                tenant_id = %tenant_id,
                user_id = %user_id,
                attempts = counter.value,
                "Two-factor attempt limit exceeded"
            );
            return Err(AuthError::RateLimited {
                retry_after: counter.ttl_remaining.as_secs().max(1),
            });
        }
        Ok(())
    }

    async fn reset_attempts(&self, tenant_id: Uuid, user_id: Uuid) {
        if let Err(err) = self.cache.delete(&attempts_key(tenant_id, user_id)).await {
            warn!(error = %err, "Failed to reset two-factor attempt counter");
        }
    }

    async fn load_user(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<User> {
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                UserRepository::new(&txn).get(user_id).await
            })
            .await
    }

    fn encrypt_secret(&self, tenant_id: Uuid, user_id: Uuid, secret: &str) -> AuthResult<String> {
        let aad = crypto::field_aad(tenant_id, user_id, FieldPurpose::TotpSecret);
        Ok(crypto::encrypt_field(&self.key, &aad, secret)?)
    }

    fn encrypt_backup_codes(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        codes: &[String],
    ) -> AuthResult<String> {
        let aad = crypto::field_aad(tenant_id, user_id, FieldPurpose::BackupCode);
        let encrypted = codes
            .iter()
            .map(|code| crypto::encrypt_field(&self.key, &aad, &normalize_backup_code(code)))
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_string(&encrypted)
            .map_err(|e| AuthError::internal("failed to encode backup codes", e))
    }

    fn decrypt_backup_codes(&self, user: &User) -> AuthResult<Vec<String>> {
        let Some(encoded) = user.two_factor_backup_codes.as_deref() else {
            return Ok(Vec::new());
        };
        let encrypted: Vec<String> = serde_json::from_str(encoded)
            .map_err(|e| AuthError::internal("stored backup codes are corrupt", e))?;

        let aad = crypto::field_aad(user.tenant_id, user.id, FieldPurpose::BackupCode);
        encrypted
            .iter()
            .map(|payload| crypto::decrypt_field(&self.key, &aad, payload).map_err(AuthError::from))
            .collect()
    }
}
