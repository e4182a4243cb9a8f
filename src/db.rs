//! Database connection and pool management.
//!
//! Postgres is the production store (row-level security is enforced there);
//! SQLite is accepted for tests and local tooling.

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Connect to the configured database, retrying transient failures with
/// exponential backoff.
///
/// ```no_run
/// use tenant_auth::{config::AppConfig, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = AppConfig::default();
///     let db = init_pool(&config).await?;
///     tenant_auth::db::run_migrations(&db).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    let url = cfg.database_url.trim();
    if url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        }
        .into());
    }

    // Every connection to `sqlite::memory:` opens a separate database
    let in_memory = url.starts_with("sqlite::memory:") || url.contains("mode=memory");
    let max_connections = if in_memory { 1 } else { cfg.db_max_connections.max(1) };

    let mut opt = ConnectOptions::new(url);
    opt.max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    if !in_memory {
        opt.idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800));
    }

    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        let err = match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!(
                    "Database ready ({:?}, {} connection(s), attempt {})",
                    conn.get_database_backend(),
                    max_connections,
                    attempt
                );
                return Ok(conn);
            }
            Err(err) => err,
        };

        if attempt >= CONNECT_ATTEMPTS {
            log::error!("Giving up on database after {attempt} attempts: {err}");
            return Err(DatabaseError::ConnectionFailed { source: err }.into());
        }
        log::warn!("Database connect attempt {attempt} failed: {err}; retrying in {backoff:?}");
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
        attempt += 1;
    }
}

/// Apply every pending migration, including the Postgres row-level policies.
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    Migrator::up(db, None)
        .await
        .context("failed to apply database migrations")?;
    log::info!("Database migrations applied");
    Ok(())
}
