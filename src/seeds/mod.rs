//! Database seeding functionality
//!
//! Seeds the global permission catalog and defines the built-in roles that
//! are provisioned for every tenant when its email is verified.

pub mod permissions;

pub use permissions::{SYSTEM_ROLES, SystemRole, seed_permissions};
