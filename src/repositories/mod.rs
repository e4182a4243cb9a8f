//! # Repository Layer
//!
//! Repositories encapsulate SeaORM operations for the auth entities. Each one
//! borrows a [`ScopedTxn`](crate::gateway::ScopedTxn) so it can only be used
//! inside a gateway transaction, and applies the transaction's tenant scope as
//! an explicit filter on every tenant-owned query.

pub mod audit_log;
pub mod invitation;
pub mod permission;
pub mod role;
pub mod session;
pub mod tenant;
pub mod user;

pub use audit_log::AuditLogRepository;
pub use invitation::InvitationRepository;
pub use permission::PermissionRepository;
pub use role::RoleRepository;
pub use session::SessionRepository;
pub use tenant::TenantRepository;
pub use user::UserRepository;
