//! Invitation lifecycle: create, accept, revoke and expiry.

mod test_utils;

use anyhow::{Result, anyhow};
use tenant_auth::{
    AuthError,
    invitations::AcceptInvitation,
    models::{invitation::InvitationStatus, user::UserStatus},
    orchestrator::LoginOutcome,
    repositories::{InvitationRepository, RoleRepository},
};
use test_utils::{TestApp, spawn_app, spawn_app_with, test_config, token_from};
use uuid::Uuid;

const INVITEE: &str = "new.hire@acme.com";
const INVITEE_PASSWORD: &str = "Welcome-Aboard1!";

async fn role_id(app: &TestApp, tenant_id: Uuid, name: &str) -> Result<Uuid> {
    let name = name.to_string();
    app.ctx
        .gateway
        .run_read_only(tenant_id, |txn| async move {
            RoleRepository::new(&txn).find_by_name(tenant_id, &name).await
        })
        .await?
        .map(|role| role.id)
        .ok_or_else(|| anyhow!("role not found"))
}

fn acceptance() -> AcceptInvitation {
    AcceptInvitation {
        first_name: "Grace".to_string(),
        last_name: "Hopper".to_string(),
        password: INVITEE_PASSWORD.to_string(),
    }
}

#[tokio::test]
async fn accepted_invitation_creates_active_user_with_roles() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let manager = role_id(&app, tenant.id, "manager").await?;

    let invitation = app
        .ctx
        .invitations
        .create(tenant.id, Some(owner.id), "New.Hire@Acme.com", &[manager, manager])
        .await?;
    assert_eq!(invitation.email, INVITEE);
    assert_eq!(invitation.status, InvitationStatus::Pending);
    assert_eq!(invitation.role_ids()?, vec![manager]);

    let mail = app.wait_for_mail(INVITEE, "invited to join").await?;
    assert!(mail.subject.contains("acme Inc"));
    assert!(mail.html_body.contains("https://erp.test/accept-invitation?token="));
    let token = token_from(&mail.html_body)?;
    assert_eq!(token, invitation.token);

    let user = app.ctx.invitations.accept(&token, acceptance()).await?;
    assert_eq!(user.tenant_id, tenant.id);
    assert_eq!(user.status, UserStatus::Active);
    assert!(user.email_verified);
    assert!(app.ctx.roles.has_role(tenant.id, user.id, "manager").await?);
    assert!(
        app.ctx
            .permissions
            .has_permission(tenant.id, user.id, "departments", "update")
            .await?
    );

    let outcome = app.login(INVITEE, INVITEE_PASSWORD, None).await?;
    assert!(matches!(outcome, LoginOutcome::Authenticated(_)));

    let reused = app.ctx.invitations.accept(&token, acceptance()).await;
    assert!(matches!(reused, Err(AuthError::InvalidToken)));
    assert!(app.ctx.invitations.list_pending(tenant.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn reinviting_replaces_the_pending_invitation() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let member = role_id(&app, tenant.id, "member").await?;
    let admin = role_id(&app, tenant.id, "admin").await?;

    let first = app
        .ctx
        .invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[member])
        .await?;
    let second = app
        .ctx
        .invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[admin])
        .await?;

    let pending = app.ctx.invitations.list_pending(tenant.id).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second.id);

    let stale = app.ctx.invitations.accept(&first.token, acceptance()).await;
    assert!(matches!(stale, Err(AuthError::InvalidToken)));

    let user = app.ctx.invitations.accept(&second.token, acceptance()).await?;
    assert!(app.ctx.roles.has_role(tenant.id, user.id, "admin").await?);
    assert!(!app.ctx.roles.has_role(tenant.id, user.id, "member").await?);
    Ok(())
}

#[tokio::test]
async fn invitation_input_is_validated() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let member = role_id(&app, tenant.id, "member").await?;
    let invitations = &app.ctx.invitations;

    let existing = invitations
        .create(tenant.id, Some(owner.id), "admin@acme.com", &[member])
        .await;
    assert!(matches!(existing, Err(AuthError::Conflict(_))));

    let no_roles = invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[])
        .await;
    assert!(
        matches!(no_roles, Err(AuthError::Validation { ref fields, .. }) if fields.contains_key("role_ids"))
    );

    let unknown = invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[Uuid::new_v4()])
        .await;
    assert!(matches!(unknown, Err(AuthError::Validation { .. })));

    // Roles of another tenant are invisible here
    let (globex, _) = app.verified_tenant("globex", "ops@globex.com").await?;
    let foreign = role_id(&app, globex.id, "member").await?;
    let cross = invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[foreign])
        .await;
    assert!(matches!(cross, Err(AuthError::Validation { .. })));

    let bad_email = invitations
        .create(tenant.id, Some(owner.id), "nobody", &[member])
        .await;
    assert!(matches!(bad_email, Err(AuthError::Validation { .. })));
    Ok(())
}

#[tokio::test]
async fn weak_password_does_not_consume_invitation() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let member = role_id(&app, tenant.id, "member").await?;
    let invitation = app
        .ctx
        .invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[member])
        .await?;

    let weak = app
        .ctx
        .invitations
        .accept(
            &invitation.token,
            AcceptInvitation {
                password: "weak".to_string(),
                ..acceptance()
            },
        )
        .await;
    assert!(matches!(weak, Err(AuthError::Validation { .. })));

    app.ctx
        .invitations
        .accept(&invitation.token, acceptance())
        .await?;
    Ok(())
}

#[tokio::test]
async fn revoked_invitation_cannot_be_accepted() -> Result<()> {
    let app = spawn_app().await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let member = role_id(&app, tenant.id, "member").await?;
    let invitation = app
        .ctx
        .invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[member])
        .await?;

    app.ctx
        .invitations
        .revoke(tenant.id, invitation.id, Some(owner.id))
        .await?;
    let accept = app
        .ctx
        .invitations
        .accept(&invitation.token, acceptance())
        .await;
    assert!(matches!(accept, Err(AuthError::InvalidToken)));

    let again = app
        .ctx
        .invitations
        .revoke(tenant.id, invitation.id, Some(owner.id))
        .await;
    assert!(matches!(again, Err(AuthError::Conflict(_))));

    let unknown = app
        .ctx
        .invitations
        .revoke(tenant.id, Uuid::new_v4(), None)
        .await;
    assert!(matches!(unknown, Err(AuthError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn invited_into_second_tenant_gets_a_tenant_choice() -> Result<()> {
    let app = spawn_app().await?;
    let (acme, _) = app.verified_tenant("acme", "admin@acme.com").await?;
    let (globex, globex_owner) = app.verified_tenant("globex", "ops@globex.com").await?;
    let member = role_id(&app, globex.id, "member").await?;

    let invitation = app
        .ctx
        .invitations
        .create(globex.id, Some(globex_owner.id), "admin@acme.com", &[member])
        .await?;
    app.ctx
        .invitations
        .accept(
            &invitation.token,
            AcceptInvitation {
                password: test_utils::PASSWORD.to_string(),
                ..acceptance()
            },
        )
        .await?;

    match app.login("admin@acme.com", test_utils::PASSWORD, None).await? {
        LoginOutcome::MultiTenantChoice { tenants } => {
            let mut ids: Vec<Uuid> = tenants.iter().map(|c| c.tenant_id).collect();
            ids.sort();
            let mut expected = vec![acme.id, globex.id];
            expected.sort();
            assert_eq!(ids, expected);
        }
        other => panic!("expected a tenant choice, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn overdue_invitations_are_expired_by_the_sweep() -> Result<()> {
    let mut config = test_config();
    config.invitation_ttl_seconds = 0;
    let app = spawn_app_with(config).await?;
    let (tenant, owner) = app.verified_tenant("acme", "admin@acme.com").await?;
    let member = role_id(&app, tenant.id, "member").await?;

    let invitation = app
        .ctx
        .invitations
        .create(tenant.id, Some(owner.id), INVITEE, &[member])
        .await?;
    let accept = app
        .ctx
        .invitations
        .accept(&invitation.token, acceptance())
        .await;
    assert!(matches!(accept, Err(AuthError::InvalidToken)));

    assert_eq!(app.ctx.invitations.sweep_expired().await?, 1);
    assert_eq!(app.ctx.invitations.sweep_expired().await?, 0);

    let invitation_id = invitation.id;
    let stored = app
        .ctx
        .gateway
        .run_read_only(tenant.id, |txn| async move {
            InvitationRepository::new(&txn).find_by_id(invitation_id).await
        })
        .await?
        .ok_or_else(|| anyhow!("invitation vanished"))?;
    assert_eq!(stored.status, InvitationStatus::Expired);
    assert!(app.ctx.invitations.list_pending(tenant.id).await?.is_empty());
    Ok(())
}
