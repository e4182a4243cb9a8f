//! # Data Models
//!
//! SeaORM entities for the authentication core. `tenants` and `permissions`
//! are global catalogs; every other entity is tenant-owned.

pub mod audit_log;
pub mod invitation;
pub mod permission;
pub mod role;
pub mod role_permission;
pub mod session;
pub mod tenant;
pub mod user;
pub mod user_role;

pub use audit_log::Entity as AuditLog;
pub use invitation::Entity as Invitation;
pub use permission::Entity as Permission;
pub use role::Entity as Role;
pub use role_permission::Entity as RolePermission;
pub use session::Entity as Session;
pub use tenant::Entity as Tenant;
pub use user::Entity as User;
pub use user_role::Entity as UserRole;
