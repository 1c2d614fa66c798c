use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_TOPIC_DEPTH: usize = 64;

/// A status update tagged with the topic it was published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage<T> {
    pub topic: String,
    pub event: T,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("status bus closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe surface for status events.
///
/// Publishing never waits on subscribers: a slow subscriber lags and loses
/// the oldest events instead of holding up the publisher.
pub trait StatusBus<T>: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<StatusMessage<T>>;
    /// Returns how many subscribers received the event. Zero is not an error.
    fn publish(&self, topic: &str, event: T) -> BusResult<usize>;
}

/// In-process bus keyed by topic string.
#[derive(Debug)]
pub struct LocalBus<T> {
    topics: RwLock<HashMap<String, broadcast::Sender<StatusMessage<T>>>>,
    depth: usize,
    closed: RwLock<bool>,
}

impl<T: Clone + Send + 'static> Default for LocalBus<T> {
    fn default() -> Self {
        Self::with_depth(DEFAULT_TOPIC_DEPTH)
    }
}

impl<T: Clone + Send + 'static> LocalBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            depth: depth.max(1),
            closed: RwLock::new(false),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<StatusMessage<T>> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.depth).0)
            .clone()
    }

    /// Drops every topic whose subscribers have all gone away.
    pub fn prune(&self) -> usize {
        let mut guard = self.topics.write();
        let before = guard.len();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        before - guard.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Closes every topic. Subscribers observe `RecvError::Closed` once they
    /// have drained what was already published.
    pub fn close(&self) {
        *self.closed.write() = true;
        self.topics.write().clear();
    }
}

impl<T: Clone + Send + 'static> StatusBus<T> for LocalBus<T> {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<StatusMessage<T>> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, event: T) -> BusResult<usize> {
        if *self.closed.read() {
            return Err(BusError::Closed);
        }
        let Some(sender) = self.topics.read().get(topic).cloned() else {
            return Ok(0);
        };
        Ok(sender
            .send(StatusMessage {
                topic: topic.to_string(),
                event,
            })
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_events_for_its_topic_only() {
        let bus = LocalBus::<u32>::new();
        let mut jobs = bus.subscribe("job:1");
        let mut routes = bus.subscribe("routes");

        assert_eq!(bus.publish("job:1", 7).expect("publish ok"), 1);
        assert_eq!(bus.publish("routes", 9).expect("publish ok"), 1);

        let msg = jobs.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "job:1");
        assert_eq!(msg.event, 7);
        let msg = routes.recv().await.expect("receive ok");
        assert_eq!(msg.event, 9);
        assert!(jobs.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::<&'static str>::new();
        assert_eq!(bus.publish("nobody", "hello").expect("publish ok"), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_topics() {
        let bus = LocalBus::<u8>::new();
        let keep = bus.subscribe("keep");
        drop(bus.subscribe("gone"));
        assert_eq!(bus.prune(), 1);
        assert_eq!(bus.topic_count(), 1);
        drop(keep);
    }

    #[test]
    fn closed_bus_rejects_publish() {
        let bus = LocalBus::<u8>::new();
        let _sub = bus.subscribe("t");
        bus.close();
        assert!(matches!(bus.publish("t", 1), Err(BusError::Closed)));
    }
}
