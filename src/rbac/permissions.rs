//! # Permission Resolution & Cache
//!
//! A user's effective permissions are the union over their roles. Results are
//! cached per (tenant, user) for a bounded TTL; every mutation that can change
//! them must call one of the `invalidate_*` hooks. Within the TTL and without
//! invalidation a stale set may be served.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::error::{AuthError, AuthResult};
use crate::gateway::TransactionGateway;
use crate::models::permission::Model as Permission;
use crate::repositories::{PermissionRepository, RoleRepository};

pub fn permission_cache_key(tenant_id: Uuid, user_id: Uuid) -> String {
    format!("perm:{tenant_id}:{user_id}")
}

/// Outcome of an authorization check, returned to the caller instead of being
/// stashed in request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied { resource: String, action: String },
}

impl PermissionDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionDecision::Granted)
    }

    pub fn into_result(self) -> AuthResult<()> {
        match self {
            PermissionDecision::Granted => Ok(()),
            PermissionDecision::Denied { resource, action } => Err(AuthError::Forbidden(format!(
                "missing permission {resource}.{action}"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct PermissionResolver {
    gateway: TransactionGateway,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl PermissionResolver {
    pub fn new(gateway: TransactionGateway, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { gateway, cache, ttl }
    }

    /// Cached union of permissions across the user's roles. A user without
    /// roles has no permissions.
    pub async fn get_effective_permissions(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> AuthResult<Vec<Permission>> {
        let key = permission_cache_key(tenant_id, user_id);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<Vec<Permission>>(&cached) {
                Ok(permissions) => {
                    debug!(tenant_id = %tenant_id, user_id = %user_id, "Permission cache hit");
                    return Ok(permissions);
                }
                Err(err) => warn!(error = %err, "Discarding undecodable permission cache entry"),
            },
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Permission cache read failed; querying store"),
        }

        let permissions = self
            .gateway
            .run_read_only(tenant_id, |txn| async move {
                PermissionRepository::new(&txn)
                    .effective_for_user(user_id)
                    .await
            })
            .await?;

        match serde_json::to_string(&permissions) {
            Ok(encoded) => {
                if let Err(err) = self.cache.set_with_ttl(&key, &encoded, self.ttl).await {
                    warn!(error = %err, "Permission cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "Failed to encode permissions for cache"),
        }

        Ok(permissions)
    }

    pub async fn has_permission(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        resource: &str,
        action: &str,
    ) -> AuthResult<bool> {
        let permissions = self.get_effective_permissions(tenant_id, user_id).await?;
        Ok(permissions.iter().any(|p| p.matches(resource, action)))
    }

    /// True when at least one `(resource, action)` pair is held.
    pub async fn has_any(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        required: &[(&str, &str)],
    ) -> AuthResult<bool> {
        let permissions = self.get_effective_permissions(tenant_id, user_id).await?;
        Ok(required
            .iter()
            .any(|(resource, action)| permissions.iter().any(|p| p.matches(resource, action))))
    }

    /// True when every `(resource, action)` pair is held.
    pub async fn has_all(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        required: &[(&str, &str)],
    ) -> AuthResult<bool> {
        let permissions = self.get_effective_permissions(tenant_id, user_id).await?;
        Ok(required
            .iter()
            .all(|(resource, action)| permissions.iter().any(|p| p.matches(resource, action))))
    }

    pub async fn check(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        resource: &str,
        action: &str,
    ) -> AuthResult<PermissionDecision> {
        if self
            .has_permission(tenant_id, user_id, resource, action)
            .await?
        {
            Ok(PermissionDecision::Granted)
        } else {
            Ok(PermissionDecision::Denied {
                resource: resource.to_string(),
                action: action.to_string(),
            })
        }
    }

    pub async fn invalidate_user(&self, tenant_id: Uuid, user_id: Uuid) -> AuthResult<()> {
        self.cache
            .delete(&permission_cache_key(tenant_id, user_id))
            .await?;
        debug!(tenant_id = %tenant_id, user_id = %user_id, "Permission cache invalidated");
        Ok(())
    }

    /// Invalidate every user currently holding `role_id`.
    pub async fn invalidate_role(&self, tenant_id: Uuid, role_id: Uuid) -> AuthResult<usize> {
        let user_ids = self
            .gateway
            .run_read_only(tenant_id, |txn| async move {
                RoleRepository::new(&txn).user_ids_with_role(role_id).await
            })
            .await?;

        self.invalidate_users(tenant_id, &user_ids).await?;
        Ok(user_ids.len())
    }

    pub async fn invalidate_users(&self, tenant_id: Uuid, user_ids: &[Uuid]) -> AuthResult<()> {
        for user_id in user_ids {
            self.invalidate_user(tenant_id, *user_id).await?;
        }
        Ok(())
    }

    pub async fn invalidate_tenant(&self, tenant_id: Uuid) -> AuthResult<u64> {
        let removed = self
            .cache
            .delete_pattern(&format!("perm:{tenant_id}:*"))
            .await?;
        debug!(tenant_id = %tenant_id, removed, "Tenant permission cache invalidated");
        Ok(removed)
    }
}
