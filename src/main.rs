//! # Tenant Auth Entry Point
//!
//! Operational commands for the authentication core: schema migration,
//! permission catalog seeding and the session/invitation sweeper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use tenant_auth::{
    AuthContext,
    cache::MemoryCache,
    config::{AppConfig, ConfigLoader},
    db,
    mail::{LogMailer, MailOutbox},
    seeds,
    sweeper::Sweeper,
    telemetry,
};

/// Tenant authentication core.
#[derive(Parser, Debug)]
#[command(name = "tenant-auth", about = "Multi-tenant authentication core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Seed the global permission catalog (idempotent).
    Seed,
    /// Run one sweep pass and exit.
    Sweep,
    /// Sweep on an interval until interrupted.
    RunSweeper {
        /// Override the configured interval, in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    tracing::info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&db).await?;
            println!("Migrations applied.");
        }
        Commands::Seed => {
            let inserted = seeds::seed_permissions(&db)
                .await
                .context("seeding permission catalog")?;
            println!("Seeded {inserted} permission(s).");
        }
        Commands::Sweep => {
            let shutdown = CancellationToken::new();
            let (sweeper, outbox_worker) = build_sweeper(config, db, &shutdown, None)?;
            let stats = sweeper.sweep_once().await.context("running sweep pass")?;
            shutdown.cancel();
            outbox_worker.await.context("joining mail outbox worker")?;
            println!(
                "Removed {} expired and {} inactive session(s); expired {} invitation(s).",
                stats.expired_sessions, stats.inactive_sessions, stats.expired_invitations
            );
        }
        Commands::RunSweeper { interval } => {
            let shutdown = CancellationToken::new();
            let (sweeper, outbox_worker) = build_sweeper(config, db, &shutdown, interval)?;

            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, shutting down");
                }
                signal.cancel();
            });

            sweeper.run(shutdown).await;
            outbox_worker.await.context("joining mail outbox worker")?;
        }
    }

    Ok(())
}

fn build_sweeper(
    config: AppConfig,
    db: sea_orm::DatabaseConnection,
    shutdown: &CancellationToken,
    interval_override: Option<u64>,
) -> Result<(Sweeper, tokio::task::JoinHandle<()>)> {
    let interval = Duration::from_secs(interval_override.unwrap_or(config.sweep_interval_seconds));
    let cache = Arc::new(MemoryCache::new(config.cache_capacity));
    let (outbox, worker) = MailOutbox::start(Arc::new(LogMailer), shutdown.clone());

    let ctx = AuthContext::build(config, db, cache, outbox).context("wiring auth context")?;
    Ok((
        Sweeper::new(ctx.sessions.clone(), ctx.invitations.clone(), interval),
        worker,
    ))
}
