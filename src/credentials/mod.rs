//! Credential & token engine: password hashing and policy, signed tokens and
//! token fingerprints.

pub mod password;
pub mod token;

pub use password::PasswordHasher;
pub use token::{Claims, IssuedToken, TokenEngine, TokenError, TokenKind, TokenSubject, fingerprint};
