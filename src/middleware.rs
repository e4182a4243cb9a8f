//! # Request Authentication
//!
//! Axum middleware that resolves the tenant, authenticates the bearer access
//! token against a live session, and inserts an explicit [`Identity`] into
//! the request extensions. Authorization is a separate call,
//! [`authorize`], returning a [`PermissionDecision`].
//!
//! The tenant comes from the `X-Tenant-Id` header (UUID or slug) or, failing
//! that, from the first label of a subdomain `Host`.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, HOST},
        request::Parts,
    },
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::context::AuthContext;
use crate::credentials::{TokenKind, fingerprint};
use crate::error::{ApiError, AuthError, AuthResult};
use crate::rbac::PermissionDecision;
use crate::repositories::TenantRepository;
use crate::telemetry::{TraceContext, with_trace_context};
use crate::validation;

pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// The authenticated caller, passed explicitly to every core operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_slug: String,
    pub email: String,
    pub session_id: Uuid,
}

/// How the request named its tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantHint {
    Id(Uuid),
    Slug(String),
}

impl TenantHint {
    fn matches(&self, tenant_id: Uuid, tenant_slug: &str) -> bool {
        match self {
            TenantHint::Id(id) => *id == tenant_id,
            TenantHint::Slug(slug) => slug == tenant_slug,
        }
    }
}

/// Middleware guarding routes that need an authenticated caller.
pub async fn require_identity(
    State(ctx): State<AuthContext>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace = TraceContext::from_header(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );

    with_trace_context(trace, async move {
        let mut request = request;
        let identity = authenticate(&ctx, request.headers()).await?;
        tracing::debug!(
            tenant_id = %identity.tenant_id,
            user_id = %identity.user_id,
            session_id = %identity.session_id,
            "Authenticated request"
        );

        request.extensions_mut().insert(identity);
        Ok(next.run(request).await)
    })
    .await
}

/// Authenticate the request headers to an [`Identity`].
pub async fn authenticate(ctx: &AuthContext, headers: &HeaderMap) -> AuthResult<Identity> {
    let token = extract_bearer_token(headers)?;
    let hint = tenant_hint(headers)?;

    let claims = ctx.tokens.validate(token, TokenKind::Access)?;
    if !hint.matches(claims.tenant_id, &claims.tenant_slug) {
        tracing::warn!(
            token_tenant_id = %claims.tenant_id,
            "Access token presented to another tenant"
        );
        return Err(AuthError::Forbidden(
            "token was issued for another tenant".to_string(),
        ));
    }

    let tenant_id = claims.tenant_id;
    let tenant = ctx
        .gateway
        .run_read_only(tenant_id, |txn| async move {
            TenantRepository::new(&txn).find_by_id(tenant_id).await
        })
        .await?;
    if !tenant.is_some_and(|t| t.is_active()) {
        return Err(AuthError::InvalidToken);
    }

    let session = ctx
        .sessions
        .find_by_fingerprint(tenant_id, &fingerprint(token))
        .await
        .map_err(|err| match err {
            AuthError::NotFound(_) => AuthError::InvalidToken,
            other => other,
        })?;
    if session.user_id != claims.sub {
        return Err(AuthError::InvalidToken);
    }

    ctx.sessions.touch(tenant_id, session.id).await;

    Ok(Identity {
        user_id: claims.sub,
        tenant_id,
        tenant_slug: claims.tenant_slug,
        email: claims.email,
        session_id: session.id,
    })
}

/// Whether `identity` holds `resource.action`.
pub async fn authorize(
    ctx: &AuthContext,
    identity: &Identity,
    resource: &str,
    action: &str,
) -> AuthResult<PermissionDecision> {
    ctx.permissions
        .check(identity.tenant_id, identity.user_id, resource, action)
        .await
}

fn extract_bearer_token(headers: &HeaderMap) -> AuthResult<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidToken)
}

/// Tenant named by the `X-Tenant-Id` header, else by the `Host` subdomain.
pub fn tenant_hint(headers: &HeaderMap) -> AuthResult<TenantHint> {
    if let Some(value) = headers.get(TENANT_HEADER) {
        let value = value
            .to_str()
            .map_err(|_| AuthError::validation(TENANT_HEADER, "header must be valid UTF-8"))?
            .trim();

        if let Ok(id) = value.parse::<Uuid>() {
            return Ok(TenantHint::Id(id));
        }
        let slug = value.to_lowercase();
        if validation::valid_slug(&slug) {
            return Ok(TenantHint::Slug(slug));
        }
        return Err(AuthError::validation(
            TENANT_HEADER,
            "must be a tenant id or slug",
        ));
    }

    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(subdomain_slug)
        .map(TenantHint::Slug)
        .ok_or_else(|| AuthError::validation(TENANT_HEADER, "tenant could not be resolved"))
}

/// `acme.example.com[:port]` -> `acme`. Hosts without a subdomain yield `None`.
fn subdomain_slug(host: &str) -> Option<String> {
    let host = host.split(':').next()?.trim().to_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    let candidate = labels[0];
    (candidate != "www" && validation::valid_slug(candidate)).then(|| candidate.to_string())
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken.into())
    }
}
