//! Distributed broadcast backend.
//!
//! An endpoint publishes each of its broadcasts on `herald.<schema>` and
//! subscribes to the same topics, so broadcasts reach peers connected to
//! other endpoints (usually in other processes) sharing the backend.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::Result;

/// Prefix of every broadcast topic.
pub const TOPIC_PREFIX: &str = "herald.";

/// Topic a schema's broadcasts travel on.
pub fn topic_for(schema: &str) -> String {
    format!("{TOPIC_PREFIX}{schema}")
}

/// One broadcast relayed through the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Identity of the publishing endpoint.
    pub origin: String,
    /// Unique per endpoint instance, even when identities collide. An
    /// endpoint ignores publications carrying its own source.
    pub source: String,
    /// Peer identity that must not receive the message.
    pub exclude: Option<String>,
    /// Codec-encoded record without the discriminator byte.
    pub payload: Bytes,
}

/// Callback invoked for every publication on a subscribed topic.
pub type PublicationHandler = Arc<dyn Fn(Publication) + Send + Sync>;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Publish/subscribe backend.
pub trait PubSub: Send + Sync {
    /// Deliver `publication` to every subscriber of `topic`, including the
    /// publisher's own subscriptions.
    fn publish(&self, topic: &str, publication: Publication) -> Result<()>;

    /// Register `handler` for `topic`.
    fn subscribe(&self, topic: &str, handler: PublicationHandler) -> Result<SubscriptionId>;

    /// Remove a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, _topic: &str, _id: SubscriptionId) -> Result<()> {
        Ok(())
    }
}

/// In-process backend.
///
/// Delivery is synchronous: `publish` returns after every handler ran.
/// Share one instance through an `Arc` between endpoints that should see
/// each other's broadcasts.
#[derive(Default)]
pub struct LocalPubSub {
    topics: Mutex<HashMap<String, Vec<(SubscriptionId, PublicationHandler)>>>,
    next_id: AtomicU64,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl fmt::Debug for LocalPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = topics.keys().collect();
        names.sort();
        f.debug_struct("LocalPubSub").field("topics", &names).finish()
    }
}

impl PubSub for LocalPubSub {
    fn publish(&self, topic: &str, publication: Publication) -> Result<()> {
        // Handlers run outside the lock; they may publish or subscribe.
        let handlers: Vec<PublicationHandler> = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        tracing::trace!(topic, subscribers = handlers.len(), "publish");
        for handler in handlers {
            handler(publication.clone());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: PublicationHandler) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<()> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|(sub, _)| *sub != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(origin: &str, exclude: Option<&str>) -> Publication {
        Publication {
            origin: origin.to_string(),
            source: format!("{origin}-instance"),
            exclude: exclude.map(str::to_string),
            payload: Bytes::from_static(b"\x00\x01"),
        }
    }

    #[test]
    fn topics_are_prefixed() {
        assert_eq!(topic_for("chat"), "herald.chat");
    }

    #[test]
    fn delivers_to_topic_subscribers_only() {
        let bus = LocalPubSub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(
            "herald.chat",
            Arc::new(move |p: Publication| sink.lock().unwrap().push(p)),
        )
        .unwrap();

        bus.publish("herald.chat", publication("a", Some("x")))
            .unwrap();
        bus.publish("herald.other", publication("b", None)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, "a");
        assert_eq!(seen[0].exclude.as_deref(), Some("x"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = LocalPubSub::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = bus
            .subscribe(
                "t",
                Arc::new(move |_: Publication| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        bus.publish("t", publication("a", None)).unwrap();
        bus.unsubscribe("t", id).unwrap();
        bus.publish("t", publication("a", None)).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let bus = Arc::new(LocalPubSub::new());
        let count = Arc::new(AtomicU64::new(0));

        let inner_bus = Arc::clone(&bus);
        bus.subscribe(
            "first",
            Arc::new(move |p: Publication| {
                inner_bus.publish("second", p).unwrap();
            }),
        )
        .unwrap();
        let counter = Arc::clone(&count);
        bus.subscribe(
            "second",
            Arc::new(move |_: Publication| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        bus.publish("first", publication("a", None)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
