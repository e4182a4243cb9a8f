//! Two-factor enrollment, challenge completion, backup codes, attempt
//! limiting and trusted devices.

mod test_utils;

use anyhow::{Result, anyhow};
use tenant_auth::{
    AuthError,
    credentials::TokenKind,
    models::{tenant::Model as Tenant, user::Model as User},
    orchestrator::{LoginOutcome, LoginRequest, TwoFactorCompletion},
    repositories::UserRepository,
    two_factor::{BACKUP_CODE_COUNT, TwoFactorSetup},
};
use test_utils::{PASSWORD, TestApp, spawn_app, totp_now};

const EMAIL: &str = "admin@acme.com";

async fn enrolled_owner(app: &TestApp) -> Result<(Tenant, User, TwoFactorSetup)> {
    let (tenant, owner) = app.verified_tenant("acme", EMAIL).await?;
    let setup = app
        .ctx
        .orchestrator
        .begin_two_factor_setup(tenant.id, owner.id)
        .await?;
    app.ctx
        .orchestrator
        .enable_two_factor(
            tenant.id,
            owner.id,
            &setup.secret,
            &totp_now(&setup.secret)?,
            &setup.backup_codes,
        )
        .await?;
    Ok((tenant, owner, setup))
}

async fn challenge(app: &TestApp, request: LoginRequest) -> Result<String> {
    match app.ctx.orchestrator.login(request).await? {
        LoginOutcome::TwoFactorChallenge {
            challenge_token, ..
        } => Ok(challenge_token),
        other => Err(anyhow!("expected a 2FA challenge, got {other:?}")),
    }
}

fn login_request() -> LoginRequest {
    LoginRequest {
        email: EMAIL.to_string(),
        password: PASSWORD.to_string(),
        ..LoginRequest::default()
    }
}

/// A six digit code guaranteed to differ from `code`.
fn wrong_code(code: &str) -> String {
    let value: u32 = code.parse().unwrap_or_default();
    format!("{:06}", (value + 500_000) % 1_000_000)
}

#[tokio::test]
async fn setup_material_is_complete_and_not_persisted() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", EMAIL).await?;

    let setup = app
        .ctx
        .orchestrator
        .begin_two_factor_setup(tenant.id, owner.id)
        .await?;
    assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));
    assert!(!setup.qr_image.is_empty());
    assert_eq!(setup.backup_codes.len(), BACKUP_CODE_COUNT);

    let status = app.ctx.two_factor.status(owner.id, tenant.id).await?;
    assert!(!status.enabled);

    let wrong = app
        .ctx
        .orchestrator
        .enable_two_factor(
            tenant.id,
            owner.id,
            &setup.secret,
            &wrong_code(&totp_now(&setup.secret)?),
            &setup.backup_codes,
        )
        .await;
    assert!(matches!(wrong, Err(AuthError::Validation { .. })));
    assert!(!app.ctx.two_factor.status(owner.id, tenant.id).await?.enabled);
    Ok(())
}

#[tokio::test]
async fn enabling_stores_encrypted_material_and_notifies() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;

    let stored = app.user(tenant.id, owner.id).await?;
    assert!(stored.two_factor_enabled);
    let secret = stored.two_factor_secret.unwrap_or_default();
    assert!(!secret.is_empty());
    assert!(!secret.contains(&setup.secret));
    let codes = stored.two_factor_backup_codes.unwrap_or_default();
    assert!(!codes.contains(&setup.backup_codes[0]));

    let status = app.ctx.two_factor.status(owner.id, tenant.id).await?;
    assert!(status.enabled);
    assert_eq!(status.backup_codes_remaining, BACKUP_CODE_COUNT);

    app.wait_for_mail(EMAIL, "Two-factor").await?;

    let again = app
        .ctx
        .orchestrator
        .begin_two_factor_setup(tenant.id, owner.id)
        .await;
    assert!(matches!(again, Err(AuthError::Conflict(_))));
    Ok(())
}

#[tokio::test]
async fn login_with_2fa_issues_challenge_then_session_once() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;

    let challenge_token = challenge(&app, login_request()).await?;
    assert!(
        app.ctx
            .sessions
            .list_active(tenant.id, owner.id)
            .await?
            .is_empty()
    );
    // A challenge token is not an access token
    assert!(
        app.ctx
            .tokens
            .validate(&challenge_token, TokenKind::Access)
            .is_err()
    );

    let completion = TwoFactorCompletion {
        challenge_token: challenge_token.clone(),
        code: totp_now(&setup.secret)?,
        ..TwoFactorCompletion::default()
    };
    let tokens = app
        .ctx
        .orchestrator
        .complete_two_factor(completion.clone())
        .await?;
    assert_eq!(tokens.user_id, owner.id);
    assert!(tokens.trusted_device_token.is_none());
    assert_eq!(
        app.ctx.sessions.list_active(tenant.id, owner.id).await?.len(),
        1
    );

    let replay = app.ctx.orchestrator.complete_two_factor(completion).await;
    assert!(matches!(replay, Err(AuthError::InvalidToken)));
    assert_eq!(
        app.ctx.sessions.list_active(tenant.id, owner.id).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn wrong_second_factor_is_rejected_without_burning_challenge() -> Result<()> {
    let app = spawn_app().await?;
    let (_, _, setup) = enrolled_owner(&app).await?;
    let challenge_token = challenge(&app, login_request()).await?;

    let wrong = app
        .ctx
        .orchestrator
        .complete_two_factor(TwoFactorCompletion {
            challenge_token: challenge_token.clone(),
            code: wrong_code(&totp_now(&setup.secret)?),
            ..TwoFactorCompletion::default()
        })
        .await;
    assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));

    app.ctx
        .orchestrator
        .complete_two_factor(TwoFactorCompletion {
            challenge_token,
            code: totp_now(&setup.secret)?,
            ..TwoFactorCompletion::default()
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn backup_codes_are_single_use() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;
    let first = setup.backup_codes[0].clone();

    let challenge_token = challenge(&app, login_request()).await?;
    app.ctx
        .orchestrator
        .complete_two_factor(TwoFactorCompletion {
            challenge_token,
            // Case and separators are ignored
            code: first.to_lowercase().replace('-', " "),
            ..TwoFactorCompletion::default()
        })
        .await?;
    let status = app.ctx.two_factor.status(owner.id, tenant.id).await?;
    assert_eq!(status.backup_codes_remaining, BACKUP_CODE_COUNT - 1);

    let challenge_token = challenge(&app, login_request()).await?;
    let reused = app
        .ctx
        .orchestrator
        .complete_two_factor(TwoFactorCompletion {
            challenge_token: challenge_token.clone(),
            code: first,
            ..TwoFactorCompletion::default()
        })
        .await;
    assert!(matches!(reused, Err(AuthError::InvalidCredentials)));

    // The remaining codes still work
    app.ctx
        .orchestrator
        .complete_two_factor(TwoFactorCompletion {
            challenge_token,
            code: setup.backup_codes[1].clone(),
            ..TwoFactorCompletion::default()
        })
        .await?;
    let status = app.ctx.two_factor.status(owner.id, tenant.id).await?;
    assert_eq!(status.backup_codes_remaining, BACKUP_CODE_COUNT - 2);
    Ok(())
}

#[tokio::test]
async fn sixth_attempt_in_window_is_rate_limited() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;
    let engine = &app.ctx.two_factor;

    for _ in 0..5 {
        let code = wrong_code(&totp_now(&setup.secret)?);
        assert!(!engine.verify_code(owner.id, tenant.id, &code).await?);
    }

    let limited = engine
        .verify_code(owner.id, tenant.id, &totp_now(&setup.secret)?)
        .await;
    match limited {
        Err(AuthError::RateLimited { retry_after }) => assert!(retry_after > 0),
        other => panic!("expected rate limit, got {other:?}"),
    }

    // Backup codes share the same budget
    let backup = engine
        .verify_and_consume_backup_code(owner.id, tenant.id, &setup.backup_codes[0])
        .await;
    assert!(matches!(backup, Err(AuthError::RateLimited { .. })));
    Ok(())
}

#[tokio::test]
async fn successful_verification_resets_attempt_window() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;
    let engine = &app.ctx.two_factor;

    for _ in 0..4 {
        let code = wrong_code(&totp_now(&setup.secret)?);
        assert!(!engine.verify_code(owner.id, tenant.id, &code).await?);
    }
    assert!(
        engine
            .verify_code(owner.id, tenant.id, &totp_now(&setup.secret)?)
            .await?
    );

    for _ in 0..5 {
        let code = wrong_code(&totp_now(&setup.secret)?);
        assert!(!engine.verify_code(owner.id, tenant.id, &code).await?);
    }
    Ok(())
}

#[tokio::test]
async fn trusted_device_skips_challenge() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;

    let challenge_token = challenge(&app, login_request()).await?;
    let tokens = app
        .ctx
        .orchestrator
        .complete_two_factor(TwoFactorCompletion {
            challenge_token,
            code: totp_now(&setup.secret)?,
            trust_device: Some("laptop-1".to_string()),
            ..TwoFactorCompletion::default()
        })
        .await?;
    let device_token = tokens
        .trusted_device_token
        .ok_or_else(|| anyhow!("device token missing"))?;

    let trusted = app
        .ctx
        .orchestrator
        .login(LoginRequest {
            device_fingerprint: Some("laptop-1".to_string()),
            device_token: Some(device_token.clone()),
            ..login_request()
        })
        .await?;
    assert!(matches!(trusted, LoginOutcome::Authenticated(_)));

    // Token bound to another fingerprint does not count
    challenge(
        &app,
        LoginRequest {
            device_fingerprint: Some("phone-7".to_string()),
            device_token: Some(device_token.clone()),
            ..login_request()
        },
    )
    .await?;

    assert!(
        app.ctx
            .two_factor
            .is_trusted(owner.id, tenant.id, "laptop-1", &device_token)
            .await?
    );

    // Disabling 2FA forgets trusted devices and removes the challenge
    app.ctx
        .orchestrator
        .disable_two_factor(tenant.id, owner.id, PASSWORD)
        .await?;
    assert!(
        !app.ctx
            .two_factor
            .is_trusted(owner.id, tenant.id, "laptop-1", &device_token)
            .await?
    );
    let plain = app.ctx.orchestrator.login(login_request()).await?;
    assert!(matches!(plain, LoginOutcome::Authenticated(_)));
    Ok(())
}

#[tokio::test]
async fn disable_requires_password() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, _) = enrolled_owner(&app).await?;

    let denied = app
        .ctx
        .orchestrator
        .disable_two_factor(tenant.id, owner.id, "Not-the-pass1!")
        .await;
    assert!(matches!(denied, Err(AuthError::InvalidCredentials)));
    assert!(app.ctx.two_factor.status(owner.id, tenant.id).await?.enabled);

    app.ctx
        .orchestrator
        .disable_two_factor(tenant.id, owner.id, PASSWORD)
        .await?;
    let status = app.ctx.two_factor.status(owner.id, tenant.id).await?;
    assert!(!status.enabled);
    assert_eq!(status.backup_codes_remaining, 0);
    Ok(())
}

#[tokio::test]
async fn regenerated_backup_codes_replace_old_ones() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;

    let fresh = app
        .ctx
        .two_factor
        .regenerate_backup_codes(owner.id, tenant.id, &totp_now(&setup.secret)?)
        .await?;
    assert_eq!(fresh.len(), BACKUP_CODE_COUNT);

    let old = app
        .ctx
        .two_factor
        .verify_and_consume_backup_code(owner.id, tenant.id, &setup.backup_codes[0])
        .await?;
    assert!(!old);
    let new = app
        .ctx
        .two_factor
        .verify_and_consume_backup_code(owner.id, tenant.id, &fresh[0])
        .await?;
    assert!(new);
    Ok(())
}

#[tokio::test]
async fn concurrent_use_of_one_backup_code_succeeds_once() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;
    let engine = &app.ctx.two_factor;
    let code = &setup.backup_codes[3];

    let (left, right) = tokio::join!(
        engine.verify_and_consume_backup_code(owner.id, tenant.id, code),
        engine.verify_and_consume_backup_code(owner.id, tenant.id, code),
    );
    let accepted = [left?, right?].into_iter().filter(|ok| *ok).count();
    assert_eq!(accepted, 1);

    let status = engine.status(owner.id, tenant.id).await?;
    assert_eq!(status.backup_codes_remaining, BACKUP_CODE_COUNT - 1);
    Ok(())
}

#[tokio::test]
async fn enabling_twice_is_a_conflict() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner, setup) = enrolled_owner(&app).await?;

    let again = app
        .ctx
        .two_factor
        .enable(
            owner.id,
            tenant.id,
            &setup.secret,
            &totp_now(&setup.secret)?,
            &setup.backup_codes,
        )
        .await;
    assert!(matches!(again, Err(AuthError::Conflict(_))));
    Ok(())
}

#[tokio::test]
async fn row_lock_requires_a_writable_transaction() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", EMAIL).await?;
    let owner_id = owner.id;

    let locked = app
        .ctx
        .gateway
        .run_in_tenant_context(tenant.id, |txn| async move {
            UserRepository::new(&txn).get_for_update(owner_id).await
        })
        .await?;
    assert_eq!(locked.id, owner_id);

    let read_only = app
        .ctx
        .gateway
        .run_read_only(tenant.id, |txn| async move {
            UserRepository::new(&txn).get_for_update(owner_id).await
        })
        .await;
    assert!(matches!(read_only, Err(AuthError::Internal(_))));
    Ok(())
}
