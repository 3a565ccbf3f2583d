//! Out-of-band delivery of one-time codes.
//!
//! Delivery is fire-and-forget: a failed send is logged and never rolls back the record
//! that produced the message.

use std::sync::Arc;

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), String>;
}

/// Writes messages to the service log. The default channel when no mail provider is set.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), String> {
        tracing::info!(target: "webrpl::notify", %recipient, %subject, "{body}");
        Ok(())
    }
}

/// Spawn delivery in the background.
pub fn deliver(notifier: Arc<dyn Notifier>, recipient: String, subject: String, body: String) {
    tokio::spawn(async move {
        match notifier.send(&recipient, &subject, &body).await {
            Ok(()) => tracing::debug!(%recipient, "notification sent"),
            Err(e) => tracing::warn!(%recipient, error = %e, "notification delivery failed"),
        }
    });
}
