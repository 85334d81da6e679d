//! Fire-and-forget webhook notifier.
//!
//! Subscribes to the call event stream and POSTs a subset of events to a
//! single configured URL. Delivery failures are logged and never surface
//! into call handling.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::{CallEvent, CallRegistry};

/// Event kinds forwarded to the webhook. Transcriptions are forwarded only
/// when final.
const FORWARDED: [&str; 7] = [
    "call.inbound",
    "call.answered",
    "call.ready",
    "call.dtmf",
    "call.ended",
    "call.speak_finished",
    "call.transcription",
];

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    /// Spawn the notifier task, if a URL is configured.
    pub fn spawn(url: Option<String>, registry: &CallRegistry) -> Option<JoinHandle<()>> {
        let url = url?;
        let notifier = WebhookNotifier {
            url,
            http: reqwest::Client::new(),
        };
        let rx = registry.subscribe();
        Some(tokio::spawn(notifier.run(rx)))
    }

    async fn run(self, mut rx: broadcast::Receiver<CallEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "webhook notifier lagged behind event stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if !Self::should_forward(&event) {
                continue;
            }
            let body = serde_json::json!({
                "event": event.kind,
                "data": {
                    "callID": event.call_id,
                    "payload": event.data,
                },
                "timestamp": event.timestamp,
            });
            let request = self
                .http
                .post(&self.url)
                .timeout(DELIVERY_TIMEOUT)
                .json(&body)
                .send();
            let url = self.url.clone();
            let kind = event.kind.clone();
            // Fire and forget; a slow endpoint must not stall the stream.
            tokio::spawn(async move {
                match request.await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(kind, "webhook delivered");
                    }
                    Ok(resp) => {
                        warn!(kind, url, status = %resp.status(), "webhook rejected");
                    }
                    Err(e) => warn!(kind, url, "webhook delivery failed: {e}"),
                }
            });
        }
    }

    fn should_forward(event: &CallEvent) -> bool {
        if !FORWARDED.contains(&event.kind.as_str()) {
            return false;
        }
        if event.kind == "call.transcription" {
            return event.data.get("is_final").and_then(|v| v.as_bool()) == Some(true);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &str, data: serde_json::Value) -> CallEvent {
        CallEvent::new(kind, "c1", data)
    }

    #[test]
    fn only_selected_kinds_are_forwarded() {
        assert!(WebhookNotifier::should_forward(&event(
            "call.inbound",
            serde_json::json!({})
        )));
        assert!(WebhookNotifier::should_forward(&event(
            "call.ended",
            serde_json::json!({})
        )));
        assert!(!WebhookNotifier::should_forward(&event(
            "call.audio_frame",
            serde_json::json!({})
        )));
        assert!(!WebhookNotifier::should_forward(&event(
            "call.state_changed",
            serde_json::json!({})
        )));
    }

    #[test]
    fn partial_transcriptions_are_not_forwarded() {
        assert!(!WebhookNotifier::should_forward(&event(
            "call.transcription",
            serde_json::json!({"text": "hel", "is_partial": true, "is_final": false})
        )));
        assert!(WebhookNotifier::should_forward(&event(
            "call.transcription",
            serde_json::json!({"text": "hello", "is_partial": false, "is_final": true})
        )));
    }
}
