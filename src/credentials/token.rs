//! Signed access, refresh and 2FA challenge tokens (HS256 JWT).
//!
//! Access and challenge tokens are signed with the access secret; refresh
//! tokens with a distinct refresh secret. Every token carries a `kind` claim
//! that validation checks, so a token of one kind is never accepted as another.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::config::JwtConfig;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token signature or format invalid: {0}")]
    Invalid(String),
    #[error("expected {expected} token, got {actual}")]
    WrongKind {
        expected: TokenKind,
        actual: TokenKind,
    },
    #[error("failed to sign token: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "access")]
    Access,
    #[serde(rename = "refresh")]
    Refresh,
    #[serde(rename = "2fa")]
    Challenge,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Challenge => "2fa",
        })
    }
}

/// Identity carried by every token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_slug: String,
    pub email: String,
    /// Session the token belongs to. Absent on 2FA challenge tokens.
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    pub tenant_id: Uuid,
    pub tenant_slug: String,
    pub email: String,
    pub kind: TokenKind,
    /// Carried so refresh and 2FA completion keep the original login policy.
    #[serde(default)]
    pub remember_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: Uuid,
}

impl Claims {
    pub fn subject(&self) -> TokenSubject {
        TokenSubject {
            user_id: self.sub,
            tenant_id: self.tenant_id,
            tenant_slug: self.tenant_slug.clone(),
            email: self.email.clone(),
            session_id: self.sid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    /// Lifetime in seconds from issuance.
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct TokenEngine {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    issuer: String,
    access_ttl: u64,
    remember_me_access_ttl: u64,
    refresh_ttl: u64,
    challenge_ttl: u64,
}

impl TokenEngine {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl_seconds,
            remember_me_access_ttl: config.remember_me_access_ttl_seconds,
            refresh_ttl: config.refresh_ttl_seconds,
            challenge_ttl: config.challenge_ttl_seconds,
        }
    }

    pub fn issue_access_token(
        &self,
        subject: &TokenSubject,
        remember_me: bool,
    ) -> Result<IssuedToken, TokenError> {
        self.issue_at(subject, TokenKind::Access, remember_me, Utc::now().timestamp())
    }

    pub fn issue_refresh_token(
        &self,
        subject: &TokenSubject,
        remember_me: bool,
    ) -> Result<IssuedToken, TokenError> {
        self.issue_at(subject, TokenKind::Refresh, remember_me, Utc::now().timestamp())
    }

    /// Short-lived token bridging the password step and the 2FA step of login.
    pub fn issue_challenge_token(
        &self,
        subject: &TokenSubject,
        remember_me: bool,
    ) -> Result<IssuedToken, TokenError> {
        self.issue_at(
            subject,
            TokenKind::Challenge,
            remember_me,
            Utc::now().timestamp(),
        )
    }

    /// Issue a token as if the clock read `issued_at` (unix seconds).
    pub fn issue_at(
        &self,
        subject: &TokenSubject,
        kind: TokenKind,
        remember_me: bool,
        issued_at: i64,
    ) -> Result<IssuedToken, TokenError> {
        let expires_in = self.lifetime(kind, remember_me);
        let claims = Claims {
            sub: subject.user_id,
            tenant_id: subject.tenant_id,
            tenant_slug: subject.tenant_slug.clone(),
            email: subject.email.clone(),
            kind,
            remember_me,
            sid: subject.session_id,
            iss: self.issuer.clone(),
            iat: issued_at,
            nbf: issued_at,
            exp: issued_at + expires_in as i64,
            jti: Uuid::new_v4(),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            self.encoding_key(kind),
        )
        .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, expires_in })
    }

    /// Verify signature, issuer, time window and kind. Fails closed.
    pub fn validate(&self, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);

        let claims = jsonwebtoken::decode::<Claims>(token, self.decoding_key(expected), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })?;

        if claims.kind != expected {
            return Err(TokenError::WrongKind {
                expected,
                actual: claims.kind,
            });
        }

        Ok(claims)
    }

    pub fn lifetime(&self, kind: TokenKind, remember_me: bool) -> u64 {
        match kind {
            TokenKind::Access if remember_me => self.remember_me_access_ttl,
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
            TokenKind::Challenge => self.challenge_ttl,
        }
    }

    fn encoding_key(&self, kind: TokenKind) -> &EncodingKey {
        match kind {
            TokenKind::Refresh => &self.refresh_encoding,
            TokenKind::Access | TokenKind::Challenge => &self.access_encoding,
        }
    }

    fn decoding_key(&self, kind: TokenKind) -> &DecodingKey {
        match kind {
            TokenKind::Refresh => &self.refresh_decoding,
            TokenKind::Access | TokenKind::Challenge => &self.access_decoding,
        }
    }
}

/// One-way fingerprint stored in place of a bearer token (hex SHA-256).
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TokenEngine {
        TokenEngine::new(&JwtConfig {
            access_secret: "access-secret-for-tests".to_string(),
            refresh_secret: "refresh-secret-for-tests".to_string(),
            ..JwtConfig::default()
        })
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            tenant_slug: "acme".to_string(),
            email: "admin@acme.com".to_string(),
            session_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_access_token_roundtrip_carries_identity() {
        let engine = engine();
        let subject = subject();
        let issued = engine.issue_access_token(&subject, false).unwrap();
        assert_eq!(issued.expires_in, 900);

        let claims = engine.validate(&issued.token, TokenKind::Access).unwrap();
        assert_eq!(claims.subject(), subject);
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_remember_me_extends_access_lifetime() {
        let issued = engine().issue_access_token(&subject(), true).unwrap();
        assert_eq!(issued.expires_in, 86400);
    }

    #[test]
    fn test_access_token_rejected_as_refresh_and_challenge() {
        let engine = engine();
        let issued = engine.issue_access_token(&subject(), false).unwrap();

        assert!(matches!(
            engine.validate(&issued.token, TokenKind::Refresh),
            Err(TokenError::Invalid(_))
        ));
        assert!(matches!(
            engine.validate(&issued.token, TokenKind::Challenge),
            Err(TokenError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_challenge_token_not_accepted_as_access() {
        let engine = engine();
        let issued = engine.issue_challenge_token(&subject(), false).unwrap();
        assert_eq!(issued.expires_in, 300);

        assert!(engine.validate(&issued.token, TokenKind::Access).is_err());
        assert!(engine.validate(&issued.token, TokenKind::Challenge).is_ok());
    }

    #[test]
    fn test_refresh_uses_distinct_secret() {
        let engine = engine();
        let issued = engine.issue_refresh_token(&subject(), false).unwrap();

        assert!(engine.validate(&issued.token, TokenKind::Refresh).is_ok());
        assert!(matches!(
            engine.validate(&issued.token, TokenKind::Access),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_fails() {
        let engine = engine();
        let long_ago = Utc::now().timestamp() - 1000;
        let issued = engine
            .issue_at(&subject(), TokenKind::Access, false, long_ago)
            .unwrap();

        assert!(matches!(
            engine.validate(&issued.token, TokenKind::Access),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_tampered_token_fails() {
        let engine = engine();
        let issued = engine.issue_access_token(&subject(), false).unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');

        assert!(engine.validate(&tampered, TokenKind::Access).is_err());
        assert!(engine.validate("not.a.jwt", TokenKind::Access).is_err());
    }

    #[test]
    fn test_tokens_issued_together_are_distinct() {
        let engine = engine();
        let subject = subject();
        let a = engine.issue_access_token(&subject, false).unwrap();
        let b = engine.issue_access_token(&subject, false).unwrap();
        assert_ne!(fingerprint(&a.token), fingerprint(&b.token));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint("token");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint("token"));
        assert!(!fp.contains("token"));
    }
}
