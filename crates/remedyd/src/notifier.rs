//! Notifier - best-effort delivery of healing events.
//!
//! Events are queued on a channel and delivered by a background task so the
//! state machine never waits on a webhook. One send attempt per event; a
//! delivery failure is logged and the event discarded.

use remedy_common::NotifyEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config_watch::{snapshot, SharedConfig};

/// Fire-and-forget sender handle held by the orchestrator.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<NotifyEvent>,
}

impl Notifier {
    /// Create the sender and the receiving end for the delivery task.
    /// Tests keep the receiver to assert on emitted events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotifyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Never blocks; a closed channel is ignored because
    /// notification loss must not fail healing.
    pub fn send(&self, event: NotifyEvent) {
        if self.tx.send(event).is_err() {
            warn!("Notification channel closed, event dropped");
        }
    }
}

/// Background delivery loop. Logs every event; POSTs to the configured
/// webhook when one is set.
pub async fn deliver_loop(mut rx: mpsc::UnboundedReceiver<NotifyEvent>, config: SharedConfig) {
    let client = reqwest::Client::new();

    while let Some(event) = rx.recv().await {
        if event.is_urgent() {
            warn!("NOTIFY: {}", event.summary());
        } else {
            info!("NOTIFY: {}", event.summary());
        }

        let cfg = snapshot(&config).await;
        let Some(url) = cfg.notify.webhook_url.clone() else {
            continue;
        };

        let timeout = std::time::Duration::from_secs(cfg.notify.timeout_secs.max(1));
        let result = client
            .post(&url)
            .timeout(timeout)
            .json(&event)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(
                    "Webhook returned {} for event '{}', discarded",
                    resp.status(),
                    event.summary()
                );
            }
            Err(e) => {
                warn!("Webhook delivery failed, event discarded: {}", e);
            }
        }
    }
}
