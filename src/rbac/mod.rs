//! Role-based access control: effective-permission resolution with a cache in
//! front of it, and the role mutations that must invalidate that cache.

pub mod permissions;
pub mod roles;

pub use permissions::{PermissionDecision, PermissionResolver, permission_cache_key};
pub use roles::{RoleManager, provision_system_roles};
