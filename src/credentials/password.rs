//! Password hashing with Argon2id and the password strength policy.

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordVerifier, Version};

use crate::config::PasswordConfig;
use crate::error::{AuthError, AuthResult};

/// Hashes and verifies passwords with a configured Argon2id cost.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    min_length: usize,
    /// Hash verified when no user matched, so lookups for unknown emails cost
    /// the same as a wrong password.
    decoy_hash: String,
}

impl PasswordHasher {
    pub fn new(config: &PasswordConfig) -> AuthResult<Self> {
        let params = Params::new(config.hash_memory_kib, config.hash_iterations, 1, None)
            .map_err(|e| AuthError::internal("invalid password hash parameters", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let salt = SaltString::generate(&mut OsRng);
        let decoy_hash = argon2::PasswordHasher::hash_password(&argon2, b"decoy-password", &salt)
            .map_err(|e| AuthError::internal("failed to prepare decoy hash", e))?
            .to_string();

        Ok(Self {
            argon2,
            min_length: config.min_length,
            decoy_hash,
        })
    }

    /// Hash `plaintext` with a fresh random salt (PHC string format).
    pub fn hash(&self, plaintext: &str) -> AuthResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        argon2::PasswordHasher::hash_password(&self.argon2, plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::internal("failed to hash password", e))
    }

    /// `Ok(false)` on mismatch; `Err` only when the stored hash is malformed.
    pub fn verify(&self, plaintext: &str, hash: &str) -> AuthResult<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthError::internal("stored password hash is malformed", e))?;

        match self.argon2.verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::internal("password verification failed", e)),
        }
    }

    /// Spend one verification on the decoy hash. The result is discarded.
    pub fn verify_decoy(&self, plaintext: &str) {
        let _ = self.verify(plaintext, &self.decoy_hash);
    }

    /// [`Self::hash`] on the blocking pool, keeping Argon2 off the async
    /// workers.
    pub async fn hash_async(&self, plaintext: &str) -> AuthResult<String> {
        let hasher = self.clone();
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| AuthError::internal("password hashing task failed", e))?
    }

    /// [`Self::verify`] on the blocking pool.
    pub async fn verify_async(&self, plaintext: &str, hash: &str) -> AuthResult<bool> {
        let hasher = self.clone();
        let (plaintext, hash) = (plaintext.to_string(), hash.to_string());
        tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &hash))
            .await
            .map_err(|e| AuthError::internal("password verification task failed", e))?
    }

    pub async fn verify_decoy_async(&self, plaintext: &str) {
        let hasher = self.clone();
        let plaintext = plaintext.to_string();
        let _ = tokio::task::spawn_blocking(move || hasher.verify_decoy(&plaintext)).await;
    }

    /// Minimum length plus upper, lower, digit and symbol classes.
    pub fn check_policy(&self, plaintext: &str) -> AuthResult<()> {
        let mut problems = Vec::new();

        if plaintext.chars().count() < self.min_length {
            problems.push(format!("must be at least {} characters", self.min_length));
        }
        if !plaintext.chars().any(|c| c.is_uppercase()) {
            problems.push("must contain an uppercase letter".to_string());
        }
        if !plaintext.chars().any(|c| c.is_lowercase()) {
            problems.push("must contain a lowercase letter".to_string());
        }
        if !plaintext.chars().any(|c| c.is_ascii_digit()) {
            problems.push("must contain a digit".to_string());
        }
        if !plaintext
            .chars()
            .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
        {
            problems.push("must contain a symbol".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AuthError::validation(
                "password",
                format!("password {}", problems.join(", ")),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(&PasswordConfig {
            min_length: 8,
            hash_memory_kib: 64,
            hash_iterations: 1,
            reset_ttl_seconds: 3600,
        })
        .unwrap()
    }

    #[test]
    fn test_same_password_hashes_differently_and_both_verify() {
        let hasher = hasher();
        let first = hasher.hash("Password1!").unwrap();
        let second = hasher.hash("Password1!").unwrap();

        assert_ne!(first, second);
        assert!(hasher.verify("Password1!", &first).unwrap());
        assert!(hasher.verify("Password1!", &second).unwrap());
    }

    #[test]
    fn test_wrong_password_does_not_verify() {
        let hasher = hasher();
        let hash = hasher.hash("Password1!").unwrap();
        assert!(!hasher.verify("Password2!", &hash).unwrap());
    }

    #[test]
    fn test_malformed_hash_is_error() {
        assert!(hasher().verify("pw", "not-a-hash").is_err());
    }

    #[tokio::test]
    async fn test_async_variants_match_sync() {
        let hasher = hasher();
        let hash = hasher.hash_async("Password1!").await.unwrap();
        assert!(hasher.verify("Password1!", &hash).unwrap());
        assert!(hasher.verify_async("Password1!", &hash).await.unwrap());
        assert!(!hasher.verify_async("Password2!", &hash).await.unwrap());
        assert!(hasher.verify_async("pw", "not-a-hash").await.is_err());
        hasher.verify_decoy_async("anything").await;
    }

    #[test]
    fn test_policy() {
        let hasher = hasher();
        assert!(hasher.check_policy("Password1!").is_ok());

        match hasher.check_policy("password") {
            Err(AuthError::Validation { fields, .. }) => {
                let msg = &fields["password"];
                assert!(msg.contains("uppercase"));
                assert!(msg.contains("digit"));
                assert!(msg.contains("symbol"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        assert!(hasher.check_policy("Pa1!").is_err());
    }
}
