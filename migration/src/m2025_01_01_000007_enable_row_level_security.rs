//! Enables row-level security on every tenant-owned table (Postgres only).
//!
//! Rows are visible when `app.current_tenant_id` matches `tenant_id` or when
//! `app.bypass_rls` is `on`. Both settings are transaction-local and are set by
//! the transaction gateway. Other backends rely on the gateway's
//! application-level scope filters instead.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

const TENANT_TABLES: &[&str] = &[
    "users",
    "roles",
    "role_permissions",
    "user_roles",
    "sessions",
    "invitations",
    "audit_logs",
];

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        if backend != DatabaseBackend::Postgres {
            return Ok(());
        }

        let conn = manager.get_connection();
        for table in TENANT_TABLES {
            let sql = format!(
                "ALTER TABLE {table} ENABLE ROW LEVEL SECURITY;\n\
                 ALTER TABLE {table} FORCE ROW LEVEL SECURITY;\n\
                 DROP POLICY IF EXISTS tenant_isolation ON {table};\n\
                 CREATE POLICY tenant_isolation ON {table}\n\
                     USING (\n\
                         current_setting('app.bypass_rls', true) = 'on'\n\
                         OR tenant_id = NULLIF(current_setting('app.current_tenant_id', true), '')::uuid\n\
                     )\n\
                     WITH CHECK (\n\
                         current_setting('app.bypass_rls', true) = 'on'\n\
                         OR tenant_id = NULLIF(current_setting('app.current_tenant_id', true), '')::uuid\n\
                     );"
            );
            conn.execute_unprepared(&sql).await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        if backend != DatabaseBackend::Postgres {
            return Ok(());
        }

        let conn = manager.get_connection();
        for table in TENANT_TABLES {
            conn.execute_unprepared(&format!(
                "DROP POLICY IF EXISTS tenant_isolation ON {table};\n\
                 ALTER TABLE {table} DISABLE ROW LEVEL SECURITY;"
            ))
            .await?;
        }

        Ok(())
    }
}
