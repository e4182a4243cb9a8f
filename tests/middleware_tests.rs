//! Request authentication through the axum middleware.

mod test_utils;

use anyhow::Result;
use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    response::Response,
    routing::get,
};
use serde_json::{Value, json};
use tenant_auth::{
    credentials::fingerprint,
    middleware::{Identity, authorize, require_identity},
    models::tenant::TenantStatus,
    rbac::PermissionDecision,
    repositories::TenantRepository,
};
use test_utils::{TestApp, spawn_app};
use tower::ServiceExt;

async fn whoami(identity: Identity) -> Json<Value> {
    Json(json!({
        "user_id": identity.user_id,
        "tenant_id": identity.tenant_id,
        "tenant_slug": identity.tenant_slug,
        "email": identity.email,
    }))
}

fn router(app: &TestApp) -> Router {
    Router::new()
        .route("/me", get(whoami))
        .layer(from_fn_with_state(app.ctx.clone(), require_identity))
}

async fn call(app: &TestApp, headers: &[(&str, &str)]) -> Result<Response> {
    let mut request = Request::builder().uri("/me");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    Ok(router(app).oneshot(request.body(Body::empty())?).await?)
}

async fn json_body(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn bearer_token_with_tenant_header_yields_identity() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let tokens = app.login_tokens("admin@acme.com", tenant.id).await?;
    let bearer = format!("Bearer {}", tokens.access_token);

    let tenant_header = tenant.id.to_string();
    let by_id = call(
        &app,
        &[
            ("authorization", bearer.as_str()),
            ("x-tenant-id", tenant_header.as_str()),
        ],
    )
    .await?;
    assert_eq!(by_id.status(), StatusCode::OK);
    let body = json_body(by_id).await?;
    assert_eq!(body["user_id"], json!(owner.id));
    assert_eq!(body["tenant_slug"], "acme");
    assert_eq!(body["email"], "admin@acme.com");

    let by_slug = call(&app, &[("authorization", bearer.as_str()), ("x-tenant-id", "acme")]).await?;
    assert_eq!(by_slug.status(), StatusCode::OK);

    let by_host = call(
        &app,
        &[("authorization", bearer.as_str()), ("host", "acme.erp.example.com")],
    )
    .await?;
    assert_eq!(by_host.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn token_for_another_tenant_is_forbidden() -> Result<()> {
    let app = spawn_app().await?;
    let (acme, _) = app.verified_tenant("acme", "admin@acme.com").await?;
    app.verified_tenant("globex", "ops@globex.com").await?;
    let tokens = app.login_tokens("admin@acme.com", acme.id).await?;
    let bearer = format!("Bearer {}", tokens.access_token);

    let response = call(&app, &[("authorization", bearer.as_str()), ("x-tenant-id", "globex")]).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn missing_or_bad_credentials_are_unauthorized() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, _) = app.verified_tenant("acme", "admin@acme.com").await?;
    let tokens = app.login_tokens("admin@acme.com", tenant.id).await?;

    let anonymous = call(&app, &[("x-tenant-id", "acme")]).await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let garbage = call(
        &app,
        &[("authorization", "Bearer not-a-jwt"), ("x-tenant-id", "acme")],
    )
    .await?;
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);

    // A refresh token is not an access token
    let refresh = format!("Bearer {}", tokens.refresh_token);
    let wrong_kind = call(&app, &[("authorization", refresh.as_str()), ("x-tenant-id", "acme")]).await?;
    assert_eq!(wrong_kind.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn logged_out_session_is_rejected() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, _) = app.verified_tenant("acme", "admin@acme.com").await?;
    let tokens = app.login_tokens("admin@acme.com", tenant.id).await?;
    let bearer = format!("Bearer {}", tokens.access_token);

    let before = call(&app, &[("authorization", bearer.as_str()), ("x-tenant-id", "acme")]).await?;
    assert_eq!(before.status(), StatusCode::OK);

    app.ctx
        .orchestrator
        .logout(tenant.id, &fingerprint(&tokens.access_token))
        .await?;

    let after = call(&app, &[("authorization", bearer.as_str()), ("x-tenant-id", "acme")]).await?;
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn suspended_tenant_is_rejected() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, _) = app.verified_tenant("acme", "admin@acme.com").await?;
    let tokens = app.login_tokens("admin@acme.com", tenant.id).await?;
    let bearer = format!("Bearer {}", tokens.access_token);

    let tenant_id = tenant.id;
    app.ctx
        .gateway
        .run_in_tenant_context(tenant_id, |txn| async move {
            TenantRepository::new(&txn)
                .set_status(tenant_id, TenantStatus::Suspended)
                .await
        })
        .await?;

    let response = call(&app, &[("authorization", bearer.as_str()), ("x-tenant-id", "acme")]).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn authorize_reports_the_missing_permission() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let tokens = app.login_tokens("admin@acme.com", tenant.id).await?;

    let identity = Identity {
        user_id: owner.id,
        tenant_id: tenant.id,
        tenant_slug: tenant.slug.clone(),
        email: owner.email.clone(),
        session_id: tokens.session_id,
    };
    assert_eq!(
        authorize(&app.ctx, &identity, "company", "delete").await?,
        PermissionDecision::Granted
    );

    // Strip the owner's roles
    app.ctx
        .roles
        .assign_roles(tenant.id, owner.id, &[])
        .await?;
    assert_eq!(
        authorize(&app.ctx, &identity, "company", "delete").await?,
        PermissionDecision::Denied {
            resource: "company".into(),
            action: "delete".into(),
        }
    );
    Ok(())
}
