//! Best-effort event publication.
//!
//! Components announce state changes (circuit opened, recovery finished,
//! alert fired) through an [`EventPublisher`]; delivery is fire and forget
//! and must never fail the publishing operation.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A published event
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            published_at: chrono::Utc::now(),
        }
    }
}

/// Fire-and-forget event sink
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Shared handle to a publisher
pub type SharedPublisher = Arc<dyn EventPublisher>;

/// Fans events out to in-process subscribers over a broadcast channel.
///
/// Lagging or absent subscribers drop events rather than block the publisher.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = Event::new(topic, payload);
        // send only errors when there are no receivers
        if self.sender.send(event).is_err() {
            debug!(topic = %topic, "Event dropped, no subscribers");
        }
    }
}

/// Publisher that only records events to the log
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        info!(topic = %topic, payload = %payload, "Event published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscriber() {
        let publisher = BroadcastPublisher::new(16);
        let mut receiver = publisher.subscribe();

        publisher.publish("circuit_breaker.opened", serde_json::json!({"name": "netease"}));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.topic, "circuit_breaker.opened");
        assert_eq!(event.payload["name"], "netease");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(16);
        // must not panic or block
        publisher.publish("recovery.completed", serde_json::json!({}));
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let publisher = BroadcastPublisher::new(16);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish("alert.fired", serde_json::json!({"id": "a1"}));

        assert_eq!(first.recv().await.unwrap().payload["id"], "a1");
        assert_eq!(second.recv().await.unwrap().payload["id"], "a1");
    }
}
