//! Input checks shared by the registration, login and invitation flows.

use regex::Regex;

use crate::error::{AuthError, AuthResult};

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";
const SLUG_PATTERN: &str = r"^[a-z0-9](?:[a-z0-9-]{1,61}[a-z0-9])?$";

/// Trimmed and lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(EMAIL_PATTERN).is_ok_and(|regex| regex.is_match(email_normalized))
}

pub fn valid_slug(slug: &str) -> bool {
    Regex::new(SLUG_PATTERN).is_ok_and(|regex| regex.is_match(slug))
}

/// Normalize and validate an email, reporting failures against `field`.
pub fn require_email(field: &str, email: &str) -> AuthResult<String> {
    let normalized = normalize_email(email);
    if !valid_email(&normalized) {
        return Err(AuthError::validation(field, "must be a valid email address"));
    }
    Ok(normalized)
}

pub fn require_slug(slug: &str) -> AuthResult<String> {
    let slug = slug.trim().to_lowercase();
    if !valid_slug(&slug) {
        return Err(AuthError::validation(
            "slug",
            "must be 1-63 lowercase letters, digits or hyphens, not starting or ending with a hyphen",
        ));
    }
    Ok(slug)
}

pub fn require_non_empty(field: &str, value: &str) -> AuthResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AuthError::validation(field, "is required"));
    }
    Ok(value.to_string())
}
