//! # Role Management
//!
//! Role assignment and role permission changes. Each mutation commits first
//! and then invalidates the permission cache for the affected users; a failed
//! invalidation is logged and leaves staleness bounded by the cache TTL.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::gateway::{ScopedTxn, TransactionGateway};
use crate::models::role::Model as Role;
use crate::rbac::permissions::PermissionResolver;
use crate::repositories::{PermissionRepository, RoleRepository, UserRepository};
use crate::seeds::SYSTEM_ROLES;

/// Create the built-in roles for `tenant_id` inside the caller's transaction.
/// Returns them highest privilege first. Existing roles are reused.
pub async fn provision_system_roles(txn: &ScopedTxn, tenant_id: Uuid) -> AuthResult<Vec<Role>> {
    let catalog = PermissionRepository::new(txn).list_all().await?;
    if catalog.is_empty() {
        return Err(AuthError::Internal(
            "permission catalog is empty; run the seed command".into(),
        ));
    }

    let roles = RoleRepository::new(txn);
    let mut provisioned = Vec::with_capacity(SYSTEM_ROLES.len());

    for definition in SYSTEM_ROLES {
        let role = match roles.find_by_name(tenant_id, definition.name).await? {
            Some(existing) => existing,
            None => {
                let now = Utc::now();
                let role = roles
                    .insert(Role {
                        id: Uuid::new_v4(),
                        tenant_id,
                        name: definition.name.to_string(),
                        description: Some(definition.description.to_string()),
                        is_system: true,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;

                let grants: Vec<Uuid> = catalog
                    .iter()
                    .filter(|p| definition.grants(&p.resource, &p.action))
                    .map(|p| p.id)
                    .collect();
                roles.replace_permissions(&role, &grants).await?;
                role
            }
        };
        provisioned.push(role);
    }

    info!(tenant_id = %tenant_id, count = provisioned.len(), "System roles provisioned");
    Ok(provisioned)
}

#[derive(Clone)]
pub struct RoleManager {
    gateway: TransactionGateway,
    resolver: PermissionResolver,
}

impl RoleManager {
    pub fn new(gateway: TransactionGateway, resolver: PermissionResolver) -> Self {
        Self { gateway, resolver }
    }

    pub async fn create_role(
        &self,
        tenant_id: Uuid,
        name: &str,
        description: Option<&str>,
        permission_ids: &[Uuid],
    ) -> AuthResult<Role> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::validation("name", "role name is required"));
        }

        let now = Utc::now();
        let model = Role {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            is_system: false,
            created_at: now,
            updated_at: now,
        };
        let permission_ids = permission_ids.to_vec();

        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                ensure_permissions_exist(&txn, &permission_ids).await?;
                let roles = RoleRepository::new(&txn);
                let role = roles.insert(model).await?;
                roles.replace_permissions(&role, &permission_ids).await?;
                Ok(role)
            })
            .await
    }

    /// Replace the permission set of a custom role. System roles are immutable.
    pub async fn set_role_permissions(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> AuthResult<()> {
        let permission_ids = permission_ids.to_vec();
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                let role = load_mutable_role(&txn, role_id).await?;
                ensure_permissions_exist(&txn, &permission_ids).await?;
                RoleRepository::new(&txn)
                    .replace_permissions(&role, &permission_ids)
                    .await
            })
            .await?;

        if let Err(err) = self.resolver.invalidate_role(tenant_id, role_id).await {
            warn!(tenant_id = %tenant_id, role_id = %role_id, error = %err, "Role cache invalidation failed");
        }
        info!(tenant_id = %tenant_id, role_id = %role_id, "Role permissions replaced");
        Ok(())
    }

    pub async fn delete_role(&self, tenant_id: Uuid, role_id: Uuid) -> AuthResult<()> {
        let affected = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                load_mutable_role(&txn, role_id).await?;
                let roles = RoleRepository::new(&txn);
                let holders = roles.user_ids_with_role(role_id).await?;
                roles.delete(role_id).await?;
                Ok::<_, AuthError>(holders)
            })
            .await?;

        if let Err(err) = self.resolver.invalidate_users(tenant_id, &affected).await {
            warn!(tenant_id = %tenant_id, role_id = %role_id, error = %err, "Role cache invalidation failed");
        }
        Ok(())
    }

    /// Replace the user's role set. The old assignments are removed in the
    /// same transaction; last write wins.
    pub async fn assign_roles(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        role_ids: &[Uuid],
    ) -> AuthResult<()> {
        let role_ids = role_ids.to_vec();
        self.gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                UserRepository::new(&txn).get(user_id).await?;
                let roles = RoleRepository::new(&txn);
                let found = roles.find_many(&role_ids).await?;
                if role_ids.iter().any(|id| !found.iter().any(|role| role.id == *id)) {
                    return Err(AuthError::validation("role_ids", "unknown role"));
                }
                roles.replace_user_roles(tenant_id, user_id, &role_ids).await
            })
            .await?;

        if let Err(err) = self.resolver.invalidate_user(tenant_id, user_id).await {
            warn!(tenant_id = %tenant_id, user_id = %user_id, error = %err, "User cache invalidation failed");
        }
        info!(tenant_id = %tenant_id, user_id = %user_id, "User roles replaced");
        Ok(())
    }

    pub async fn user_roles(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<Vec<Role>> {
        self.gateway
            .run_read_only(tenant_id, |txn| async move {
                RoleRepository::new(&txn).roles_for_user(user_id).await
            })
            .await
    }

    pub async fn has_role(&self, tenant_id: Uuid, user_id: Uuid, role_name: &str) -> AuthResult<bool> {
        Ok(self
            .user_roles(tenant_id, user_id)
            .await?
            .iter()
            .any(|role| role.name == role_name))
    }

    /// Delete a user. Cache invalidation is best-effort.
    pub async fn delete_user(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<()> {
        let removed = self
            .gateway
            .run_in_tenant_context(tenant_id, |txn| async move {
                UserRepository::new(&txn).delete(user_id).await
            })
            .await?;
        if !removed {
            return Err(AuthError::NotFound("user not found".into()));
        }

        if let Err(err) = self.resolver.invalidate_user(tenant_id, user_id).await {
            warn!(tenant_id = %tenant_id, user_id = %user_id, error = %err, "User cache invalidation failed");
        }
        info!(tenant_id = %tenant_id, user_id = %user_id, "User deleted");
        Ok(())
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }
}

async fn load_mutable_role(txn: &ScopedTxn, role_id: Uuid) -> AuthResult<Role> {
    let role = RoleRepository::new(txn)
        .find_by_id(role_id)
        .await?
        .ok_or_else(|| AuthError::NotFound("role not found".into()))?;
    if role.is_system {
        return Err(AuthError::Forbidden(format!(
            "system role '{}' cannot be modified",
            role.name
        )));
    }
    Ok(role)
}

async fn ensure_permissions_exist(txn: &ScopedTxn, permission_ids: &[Uuid]) -> AuthResult<()> {
    if permission_ids.is_empty() {
        return Ok(());
    }
    let catalog = PermissionRepository::new(txn).list_all().await?;
    if permission_ids
        .iter()
        .any(|id| !catalog.iter().any(|p| p.id == *id))
    {
        return Err(AuthError::validation("permission_ids", "unknown permission"));
    }
    Ok(())
}
