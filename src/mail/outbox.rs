//! # Mail Outbox
//!
//! An unbounded queue drained by one tokio worker. Each message is retried
//! with exponential backoff up to [`MAX_DELIVERY_ATTEMPTS`]; a message that
//! still fails is logged and dropped. On shutdown the worker drains what is
//! already queued before exiting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EmailSender;

pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

impl OutboundEmail {
    pub fn new(to: impl Into<String>, (subject, html_body): (String, String)) -> Self {
        Self {
            to: to.into(),
            subject,
            html_body,
        }
    }
}

#[derive(Clone)]
pub struct MailOutbox {
    tx: mpsc::UnboundedSender<OutboundEmail>,
}

impl MailOutbox {
    /// Spawn the delivery worker. It runs until `shutdown` fires.
    pub fn start(
        sender: Arc<dyn EmailSender>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(sender, rx, shutdown));
        (Self { tx }, handle)
    }

    /// Queue a message. Never fails the caller; a closed outbox is logged.
    pub fn submit(&self, email: OutboundEmail) {
        let recipient = email.to.clone();
        if self.tx.send(email).is_err() {
            error!(recipient = %recipient, "Mail outbox closed; message dropped");
        } else {
            debug!(recipient = %recipient, "Email queued");
        }
    }
}

async fn run_worker(
    sender: Arc<dyn EmailSender>,
    mut rx: mpsc::UnboundedReceiver<OutboundEmail>,
    shutdown: CancellationToken,
) {
    info!("Mail outbox worker started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(email) = rx.recv().await {
                    deliver(sender.as_ref(), &email).await;
                }
                break;
            }
            next = rx.recv() => match next {
                Some(email) => {
                    deliver(sender.as_ref(), &email).await;
                }
                None => break,
            }
        }
    }

    info!("Mail outbox worker stopped");
}

async fn deliver(sender: &dyn EmailSender, email: &OutboundEmail) -> bool {
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match sender.send(&email.to, &email.subject, &email.html_body).await {
            Ok(()) => {
                debug!(recipient = %email.to, attempt, "Email sent");
                return true;
            }
            Err(err) if attempt < MAX_DELIVERY_ATTEMPTS => {
                warn!(
                    recipient = %email.to,
                    attempt,
                    error = %err,
                    "Email delivery failed; retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                error!(
                    recipient = %email.to,
                    attempts = attempt,
                    error = %err,
                    "Email delivery abandoned"
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Fails the first `failures` sends, then records.
    struct FlakySender {
        failures: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmailSender for FlakySender {
        async fn send(&self, to: &str, _subject: &str, _html: &str) -> Result<(), MailError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(MailError::Transport("connection refused".into()));
            }
            self.delivered.lock().await.push(to.to_string());
            Ok(())
        }
    }

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail::new(to, ("Subject".to_string(), "<p>body</p>".to_string()))
    }

    #[tokio::test]
    async fn test_retries_until_delivered() {
        let sender = FlakySender {
            failures: 2,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        };
        assert!(deliver(&sender, &email("a@example.com")).await);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*sender.delivered.lock().await, vec!["a@example.com"]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let sender = FlakySender {
            failures: 10,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        };
        assert!(!deliver(&sender, &email("a@example.com")).await);
        assert_eq!(sender.calls.load(Ordering::SeqCst), MAX_DELIVERY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let sender = Arc::new(FlakySender {
            failures: 0,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        let (outbox, handle) = MailOutbox::start(sender.clone(), shutdown.clone());

        outbox.submit(email("one@example.com"));
        outbox.submit(email("two@example.com"));
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(sender.delivered.lock().await.len(), 2);
    }
}
