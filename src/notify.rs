//! Outbound notifications and the in-process completion bus.
//!
//! Notification delivery is best-effort: [`notify_best_effort`] logs and
//! swallows failures so they can never interrupt lock release or cleanup.

use crate::worker::events::CaseTranscribed;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

pub const EVENT_CASE_TRANSCRIBED: &str = "case.transcribed";
pub const EVENT_CASE_PROGRESS: &str = "case.progress";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), String>;
}

/// Send a notification, logging instead of propagating any failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, event: &str, payload: serde_json::Value) {
    if let Err(e) = notifier.notify(event, payload).await {
        log::warn!("Failed to deliver {} notification: {}", event, e);
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), String> {
        log::info!("event {} {}", event, payload);
        Ok(())
    }
}

/// POSTs `{"event": .., "payload": ..}` to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "event": event, "payload": payload }))
            .send()
            .await
            .map_err(|e| format!("webhook request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}

/// Fan-in point for terminal `case.transcribed` signals inside one process.
///
/// Waiters must subscribe before the work they wait on is dispatched so the
/// signal cannot slip past them.
#[derive(Clone)]
pub struct CompletionBus {
    tx: broadcast::Sender<CaseTranscribed>,
}

impl CompletionBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaseTranscribed> {
        self.tx.subscribe()
    }

    /// Publish a terminal signal. Having no subscribers is normal.
    pub fn publish(&self, signal: CaseTranscribed) {
        let _ = self.tx.send(signal);
    }

    /// Wait for the terminal signal of `case_id`, bounded by `timeout`.
    pub async fn wait_for_case(
        rx: &mut broadcast::Receiver<CaseTranscribed>,
        case_id: i64,
        timeout: Duration,
    ) -> Option<CaseTranscribed> {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(signal) if signal.case_id == case_id => return Some(signal),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Completion waiter for case {} lagged by {} signals", case_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}

impl Default for CompletionBus {
    fn default() -> Self {
        Self::new(256)
    }
}
