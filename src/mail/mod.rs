//! Outbound email
//!
//! [`EmailSender`] is the delivery interface. Flows never call it directly:
//! they submit to the [`MailOutbox`], whose worker delivers after the
//! triggering transaction has committed and whose failures never reach the
//! caller.

pub mod outbox;
pub mod templates;

use async_trait::async_trait;
use thiserror::Error;

pub use outbox::{MailOutbox, OutboundEmail};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport failed: {0}")]
    Transport(String),
    #[error("mail rejected for {recipient}: {reason}")]
    Rejected { recipient: String, reason: String },
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError>;
}

/// Sender that only logs. Used when no transport is configured.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl EmailSender for LogMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        tracing::info!(
            recipient = %to,
            subject = %subject,
            body_bytes = html_body.len(),
            "Email delivered to log"
        );
        Ok(())
    }
}
