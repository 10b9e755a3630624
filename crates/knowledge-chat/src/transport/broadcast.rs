//! In-process publisher backed by one `tokio::sync::broadcast` channel per topic.
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::{EventPublisher, PublishedEvent};

pub struct BroadcastPublisher {
    topics: DashMap<String, broadcast::Sender<PublishedEvent>>,
    capacity: usize,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<PublishedEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Forget topics nobody listens to any more.
    pub fn prune(&self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, sender| sender.receiver_count() > 0);
        before - self.topics.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, topic: &str, kind: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let Some(sender) = self.topics.get(topic) else {
            trace!("No subscribers for {}, dropping {}", topic, kind);
            return Ok(());
        };
        let event = PublishedEvent {
            topic: topic.to_string(),
            kind: kind.to_string(),
            payload,
        };
        // A send error only means every receiver is gone.
        if sender.send(event).is_err() {
            trace!("All subscribers of {} left", topic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::topic_for;

    #[tokio::test]
    async fn test_subscribers_receive_topic_events() {
        let publisher = BroadcastPublisher::new(8);
        let topic = topic_for("c1");
        assert_eq!(topic, "conversation:c1");

        let mut rx = publisher.subscribe(&topic);
        publisher.publish(&topic, "turn.stream", serde_json::json!({"offset": 5})).await.unwrap();
        publisher.publish(&topic_for("c2"), "turn.stream", serde_json::json!({})).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "turn.stream");
        assert_eq!(event.payload["offset"], 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prune_drops_abandoned_topics() {
        let publisher = BroadcastPublisher::default();
        let rx = publisher.subscribe("conversation:c1");
        assert_eq!(publisher.prune(), 0);
        drop(rx);
        assert_eq!(publisher.prune(), 1);
        assert_eq!(publisher.topic_count(), 0);
    }
}
