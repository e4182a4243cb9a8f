//! # Background Sweeper
//!
//! Periodically removes expired and idle sessions and expires overdue
//! invitations. Runs until its shutdown token fires; a failed pass is logged
//! and the next tick proceeds normally.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::error::AuthResult;
use crate::invitations::InvitationService;
use crate::sessions::SessionStore;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired_sessions: u64,
    pub inactive_sessions: u64,
    pub expired_invitations: u64,
}

impl SweepStats {
    pub fn total(&self) -> u64 {
        self.expired_sessions + self.inactive_sessions + self.expired_invitations
    }
}

#[derive(Clone)]
pub struct Sweeper {
    sessions: SessionStore,
    invitations: InvitationService,
    interval: Duration,
}

impl Sweeper {
    pub fn new(sessions: SessionStore, invitations: InvitationService, interval: Duration) -> Self {
        Self {
            sessions,
            invitations,
            interval,
        }
    }

    /// Run the sweep loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_seconds = self.interval.as_secs(), "Starting sweeper");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sweeper shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "Sweep pass failed");
                    }
                }
            }
        }

        info!("Sweeper stopped");
    }

    /// One pass over sessions and invitations.
    pub async fn sweep_once(&self) -> AuthResult<SweepStats> {
        let stats = SweepStats {
            expired_sessions: self.sessions.sweep_expired().await?,
            inactive_sessions: self
                .sessions
                .sweep_inactive(self.sessions.max_inactivity())
                .await?,
            expired_invitations: self.invitations.sweep_expired().await?,
        };

        if stats.total() > 0 {
            info!(
                expired_sessions = stats.expired_sessions,
                inactive_sessions = stats.inactive_sessions,
                expired_invitations = stats.expired_invitations,
                "Sweep pass complete"
            );
        }
        Ok(stats)
    }
}
