// Notification sink: fire-and-forget fan-out of post-mutation events.
//
// The broadcast implementation feeds the WebSocket route; delivery is
// at-least-once best-effort and a missed delivery never rolls back the
// mutation that produced it.

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::metrics;

/// Abstract publish interface standing in for the real-time transport.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: &str, payload: Value);
}

/// Broadcast-channel sink. Subscribers (WebSocket handlers) receive each
/// published event as a JSON envelope; lagging subscribers drop messages,
/// which is acceptable for a best-effort stream.
pub struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, event: &str, payload: Value) {
        let envelope = json!({ "event": event, "payload": payload }).to_string();
        metrics::NOTIFICATIONS_PUBLISHED_TOTAL.inc();
        // send() errors only when no subscriber is connected; that is fine
        let _ = self.tx.send(envelope);
    }
}

/// Sink that drops everything. Used in tests and offline tooling.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _event: &str, _payload: Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_envelope() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.publish("match_finished", json!({ "match_id": 7 }));

        let raw = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["event"], "match_finished");
        assert_eq!(parsed["payload"]["match_id"], 7);
    }

    #[test]
    fn test_publish_without_subscribers_is_a_noop() {
        let sink = BroadcastSink::new(8);
        // must not panic or error out
        sink.publish("score_changed", json!({}));
        assert_eq!(sink.subscriber_count(), 0);
    }
}
