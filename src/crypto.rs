//! Field encryption for two-factor material using AES-256-GCM.
//!
//! TOTP secrets and every backup code are encrypted independently. Payloads
//! are `version || nonce || ciphertext+tag`, bound to the owning user through
//! additional authenticated data, and stored base64-encoded in text columns.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// What an encrypted field protects. Part of the AAD so a ciphertext cannot be
/// moved between fields or users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPurpose {
    TotpSecret,
    BackupCode,
}

impl FieldPurpose {
    fn as_str(&self) -> &'static str {
        match self {
            FieldPurpose::TotpSecret => "totp_secret",
            FieldPurpose::BackupCode => "backup_code",
        }
    }
}

/// AAD binding a field to `(tenant, user, purpose)`.
pub fn field_aad(tenant_id: Uuid, user_id: Uuid, purpose: FieldPurpose) -> Vec<u8> {
    format!("{}|{}|{}", tenant_id, user_id, purpose.as_str()).into_bytes()
}

pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Encrypt a UTF-8 value and return it base64-encoded for a text column.
pub fn encrypt_field(key: &CryptoKey, aad: &[u8], plaintext: &str) -> Result<String, CryptoError> {
    let payload = encrypt_bytes(key, aad, plaintext.as_bytes())?;
    Ok(general_purpose::STANDARD.encode(payload))
}

pub fn decrypt_field(key: &CryptoKey, aad: &[u8], encoded: &str) -> Result<String, CryptoError> {
    let payload = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidFormat)?;
    let bytes = decrypt_bytes(key, aad, &payload)?;
    String::from_utf8(bytes)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
}

/// URL-safe random token with `bytes` bytes of entropy.
///
/// Used for verification, password reset, invitation and trusted-device tokens.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let token = general_purpose::URL_SAFE_NO_PAD.encode(&buf);
    buf.zeroize();
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let aad = b"test-aad";
        let plaintext = b"JBSWY3DPEHPK3PXP";

        let encrypted = encrypt_bytes(&key, aad, plaintext).expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, aad, &encrypted).expect("decryption succeeds");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext_works() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"aad", b"").expect("encryption succeeds");
        let decrypted = decrypt_bytes(&key, b"aad", &encrypted).expect("decryption succeeds");
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = test_key();
        let key2 = CryptoKey::new(vec![9u8; 32]).unwrap();

        let encrypted = encrypt_bytes(&key1, b"aad", b"secret").unwrap();
        assert!(matches!(
            decrypt_bytes(&key2, b"aad", &encrypted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_different_aad_fails() {
        let key = test_key();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let encrypted = encrypt_field(
            &key,
            &field_aad(tenant, user, FieldPurpose::TotpSecret),
            "secret",
        )
        .unwrap();

        let other_user = field_aad(tenant, Uuid::new_v4(), FieldPurpose::TotpSecret);
        assert!(decrypt_field(&key, &other_user, &encrypted).is_err());

        let other_purpose = field_aad(tenant, user, FieldPurpose::BackupCode);
        assert!(decrypt_field(&key, &other_purpose, &encrypted).is_err());
    }

    #[test]
    fn test_modified_ciphertext_fails() {
        let key = test_key();
        let mut encrypted = encrypt_bytes(&key, b"aad", b"secret message").unwrap();
        encrypted[13] ^= 0x01;

        assert!(decrypt_bytes(&key, b"aad", &encrypted).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = test_key();
        let encrypted1 = encrypt_bytes(&key, b"aad", b"secret").unwrap();
        let encrypted2 = encrypt_bytes(&key, b"aad", b"secret").unwrap();

        assert_ne!(&encrypted1[1..13], &encrypted2[1..13]);
    }

    #[test]
    fn test_unversioned_payload_rejected() {
        let key = test_key();
        assert!(matches!(
            decrypt_bytes(&key, b"aad", &[0xFF, 0x01, 0x02]),
            Err(CryptoError::InvalidFormat)
        ));
        assert!(matches!(
            decrypt_bytes(&key, b"aad", &[VERSION_ENCRYPTED, 0x02]),
            Err(CryptoError::InvalidFormat)
        ));
        assert!(matches!(
            decrypt_bytes(&key, b"aad", &[]),
            Err(CryptoError::EmptyCiphertext)
        ));
    }

    #[test]
    fn test_field_roundtrip_through_base64() {
        let key = test_key();
        let encoded = encrypt_field(&key, b"aad", "ABCD-EFGH").unwrap();
        assert_eq!(decrypt_field(&key, b"aad", &encoded).unwrap(), "ABCD-EFGH");
        assert!(decrypt_field(&key, b"aad", "not base64!").is_err());
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(CryptoKey::new(vec![0u8; 64]).is_err());
    }

    #[test]
    fn test_random_tokens_are_unique_and_url_safe() {
        let a = random_token(32);
        let b = random_token(32);
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
