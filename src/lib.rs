//! # Tenant Auth Library
//!
//! Authentication and authorization core for a multi-tenant ERP: tenant
//! registration and verification, password and 2FA login, sessions, role
//! based permissions with caching, invitations and audit logging.

pub mod audit;
pub mod cache;
pub mod config;
pub mod context;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod gateway;
pub mod invitations;
pub mod mail;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod rbac;
pub mod repositories;
pub mod seeds;
pub mod sessions;
pub mod sweeper;
pub mod telemetry;
pub mod two_factor;
pub mod validation;
pub use migration;

pub use context::AuthContext;
pub use error::{AuthError, AuthResult};
