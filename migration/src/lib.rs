//! Database migrations for the tenant authentication core.
//!
//! Tenants and the permission catalog are global; every other table is
//! tenant-owned and, on Postgres, guarded by row-level security policies.

pub use sea_orm_migration::prelude::*;

mod m2025_01_01_000001_create_tenants;
mod m2025_01_01_000002_create_users;
mod m2025_01_01_000003_create_roles_and_permissions;
mod m2025_01_01_000004_create_sessions;
mod m2025_01_01_000005_create_invitations;
mod m2025_01_01_000006_create_audit_logs;
mod m2025_01_01_000007_enable_row_level_security;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_01_000001_create_tenants::Migration),
            Box::new(m2025_01_01_000002_create_users::Migration),
            Box::new(m2025_01_01_000003_create_roles_and_permissions::Migration),
            Box::new(m2025_01_01_000004_create_sessions::Migration),
            Box::new(m2025_01_01_000005_create_invitations::Migration),
            Box::new(m2025_01_01_000006_create_audit_logs::Migration),
            Box::new(m2025_01_01_000007_enable_row_level_security::Migration),
        ]
    }
}
