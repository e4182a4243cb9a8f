//! Tenant-scoped transaction gateway.
//!
//! Every statement against a tenant-owned table runs inside one of
//! [`TransactionGateway::run_in_tenant_context`],
//! [`TransactionGateway::run_with_bypass`] or
//! [`TransactionGateway::run_read_only`]. Each opens a transaction and fixes a
//! [`TenantScope`] for its lifetime:
//!
//! * on Postgres the scope is published as the transaction-local settings
//!   `app.current_tenant_id` / `app.bypass_rls`, which the row-level policies
//!   installed by the migrations consume;
//! * on every backend repositories also apply [`TenantScope::filter`] and
//!   [`TenantScope::authorize`], so SQLite enforces the same isolation.
//!
//! The closure receives an owned [`ScopedTxn`]. The transaction commits when
//! the closure returns `Ok`, rolls back when it returns `Err`, and is rolled
//! back by the driver when a panic unwinds through the call (the panic keeps
//! propagating).

use std::future::Future;
use std::sync::Arc;

use sea_orm::{
    AccessMode, ColumnTrait, Condition, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, DbErr, Statement, TransactionTrait,
};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

/// Which rows a transaction may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantScope {
    Tenant(Uuid),
    /// Row isolation disabled for trusted system operations.
    Bypass,
}

impl TenantScope {
    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            TenantScope::Tenant(id) => Some(*id),
            TenantScope::Bypass => None,
        }
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self, TenantScope::Bypass)
    }

    /// Restrict `column` to the scoped tenant. Always true under bypass.
    pub fn filter<C: ColumnTrait>(&self, column: C) -> Condition {
        match self {
            TenantScope::Tenant(id) => Condition::all().add(column.eq(*id)),
            TenantScope::Bypass => Condition::all(),
        }
    }

    /// Fail closed when `tenant_id` lies outside the scope.
    pub fn authorize(&self, tenant_id: Uuid) -> AuthResult<()> {
        match self {
            TenantScope::Tenant(id) if *id != tenant_id => {
                tracing::warn!(
                    scope_tenant_id = %id,
                    requested_tenant_id = %tenant_id,
                    "Cross-tenant access rejected"
                );
                Err(AuthError::Forbidden(
                    "resource belongs to another tenant".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// An open transaction bound to a [`TenantScope`].
pub struct ScopedTxn {
    txn: Arc<DatabaseTransaction>,
    scope: TenantScope,
    read_only: bool,
}

impl ScopedTxn {
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub fn scope(&self) -> TenantScope {
        self.scope
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Guard for write paths. Postgres also rejects writes at the store level.
    pub fn ensure_writable(&self) -> AuthResult<()> {
        if self.read_only {
            return Err(AuthError::Internal(
                "write attempted inside a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct TransactionGateway {
    db: DatabaseConnection,
}

impl TransactionGateway {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.db.get_database_backend()
    }

    /// Run `f` in a transaction scoped to `tenant_id`.
    pub async fn run_in_tenant_context<T, E, F, Fut>(&self, tenant_id: Uuid, f: F) -> Result<T, E>
    where
        E: From<DbErr>,
        F: FnOnce(ScopedTxn) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(TenantScope::Tenant(tenant_id), false, f).await
    }

    /// Run `f` with row isolation disabled. Reserved for internal call sites
    /// that cannot know the tenant yet or span tenants (token lookups, sweeps).
    pub async fn run_with_bypass<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        E: From<DbErr>,
        F: FnOnce(ScopedTxn) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(TenantScope::Bypass, false, f).await
    }

    /// Like [`Self::run_in_tenant_context`] but the transaction is read-only.
    pub async fn run_read_only<T, E, F, Fut>(&self, tenant_id: Uuid, f: F) -> Result<T, E>
    where
        E: From<DbErr>,
        F: FnOnce(ScopedTxn) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(TenantScope::Tenant(tenant_id), true, f).await
    }

    async fn run<T, E, F, Fut>(&self, scope: TenantScope, read_only: bool, f: F) -> Result<T, E>
    where
        E: From<DbErr>,
        F: FnOnce(ScopedTxn) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let backend = self.backend();
        let txn = match backend {
            DatabaseBackend::Postgres if read_only => {
                self.db
                    .begin_with_config(None, Some(AccessMode::ReadOnly))
                    .await?
            }
            _ => self.db.begin().await?,
        };

        if backend == DatabaseBackend::Postgres {
            let statement = match scope {
                TenantScope::Tenant(tenant_id) => Statement::from_sql_and_values(
                    backend,
                    "SELECT set_config('app.current_tenant_id', $1, true)",
                    [tenant_id.to_string().into()],
                ),
                TenantScope::Bypass => Statement::from_string(
                    backend,
                    "SELECT set_config('app.bypass_rls', 'on', true)",
                ),
            };
            txn.execute(statement).await?;
        }

        if scope.is_bypass() {
            tracing::debug!("Opened bypass transaction");
        }

        let txn = Arc::new(txn);
        let handle = ScopedTxn {
            txn: Arc::clone(&txn),
            scope,
            read_only,
        };

        match f(handle).await {
            Ok(value) => {
                let txn = Arc::try_unwrap(txn).map_err(|_| {
                    DbErr::Custom("transaction handle outlived its closure".to_string())
                })?;
                txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                match Arc::try_unwrap(txn) {
                    Ok(txn) => {
                        if let Err(rollback_err) = txn.rollback().await {
                            tracing::error!(error = %rollback_err, "Transaction rollback failed");
                        }
                    }
                    // Dropping the last handle rolls back
                    Err(_) => tracing::warn!("Transaction handle leaked; rollback deferred to drop"),
                }
                Err(err)
            }
        }
    }
}
