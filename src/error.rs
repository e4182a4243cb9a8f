//! # Error Handling
//!
//! [`AuthError`] is the classified failure taxonomy returned by every public
//! operation of the core. [`ApiError`] is its problem+json rendering for the
//! request boundary; it never carries store-level detail.

use std::collections::BTreeMap;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::credentials::token::TokenError;
use crate::crypto::CryptoError;
use crate::telemetry;

pub type AuthResult<T> = Result<T, AuthError>;

/// Classified failures surfaced by the authentication core.
///
/// Internal messages may be specific (they are logged); the external rendering
/// collapses credential and token failures into uniform, vague responses.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Single-field validation failure.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), message.clone());
        AuthError::Validation { message, fields }
    }

    /// Wrap an infrastructure failure with the operation that was attempted.
    pub fn internal(context: &str, cause: impl std::fmt::Display) -> Self {
        AuthError::Internal(format!("{context}: {cause}"))
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            AuthError::Validation { .. } => ErrorType::BadRequest,
            AuthError::InvalidCredentials | AuthError::InvalidToken => ErrorType::Unauthorized,
            AuthError::Forbidden(_) => ErrorType::Forbidden,
            AuthError::RateLimited { .. } => ErrorType::TooManyRequests,
            AuthError::Conflict(_) => ErrorType::Conflict,
            AuthError::NotFound(_) => ErrorType::NotFound,
            AuthError::Internal(_) => ErrorType::InternalServerError,
        }
    }
}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.iter().any(|known| code == *known)
    })
}

impl From<sea_orm::DbErr> for AuthError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return AuthError::Conflict("resource already exists".to_string());
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => AuthError::NotFound(record),
            other => AuthError::internal("database error", other),
        }
    }
}

impl From<CryptoError> for AuthError {
    fn from(error: CryptoError) -> Self {
        AuthError::internal("two-factor material could not be processed", error)
    }
}

impl From<CacheError> for AuthError {
    fn from(error: CacheError) -> Self {
        AuthError::internal("cache backend failure", error)
    }
}

impl From<TokenError> for AuthError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::Signing(cause) => AuthError::internal("failed to sign token", cause),
            other => {
                tracing::debug!(reason = %other, "Token rejected");
                AuthError::InvalidToken
            }
        }
    }
}

/// Standard error types with predefined status codes
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not Found")]
    NotFound,
    #[error("Conflict")]
    Conflict,
    #[error("Too Many Requests")]
    TooManyRequests,
    #[error("Internal Server Error")]
    InternalServerError,
}

impl ErrorType {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::Forbidden => StatusCode::FORBIDDEN,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable SCREAMING_SNAKE_CASE code for programmatic handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::Unauthorized => "UNAUTHORIZED",
            ErrorType::Forbidden => "FORBIDDEN",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::Conflict => "CONFLICT",
            ErrorType::TooManyRequests => "RATE_LIMITED",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            &error_type.to_string(),
        )
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        let error_type = error.error_type();
        let status = error_type.status_code();
        match error {
            AuthError::Validation { message, fields } => {
                Self::new(status, error_type.error_code(), message.as_str())
                    .with_details(serde_json::json!(fields))
            }
            AuthError::InvalidCredentials => {
                Self::new(status, "INVALID_CREDENTIALS", "Invalid email or password")
            }
            AuthError::InvalidToken => {
                Self::new(status, "INVALID_TOKEN", "Invalid or expired token")
            }
            AuthError::Forbidden(message) => {
                Self::new(status, error_type.error_code(), message.as_str())
            }
            AuthError::RateLimited { retry_after } => Self::new(
                status,
                error_type.error_code(),
                "Too many attempts, try again later",
            )
            .with_retry_after(retry_after),
            AuthError::Conflict(message) | AuthError::NotFound(message) => {
                Self::new(status, error_type.error_code(), message.as_str())
            }
            AuthError::Internal(cause) => {
                tracing::error!(%cause, "Internal error");
                Self::new(
                    status,
                    error_type.error_code(),
                    "An internal error occurred",
                )
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}
