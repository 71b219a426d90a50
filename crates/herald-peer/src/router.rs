//! Broadcast routing: local fan-out with identity exclusion, bridged to an
//! optional pub/sub backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use bytes::Bytes;
use herald_frame::Frame;
use herald_schema::{Record, SchemaError};
use tracing::{debug, trace, warn};

use crate::error::{PeerError, Result};
use crate::handlers::{read, write};
use crate::peer::{Context, Peer, PeerId};
use crate::pubsub::{topic_for, PubSub, Publication, SubscriptionId};

/// Live peers of an endpoint, keyed by connection serial.
///
/// Writers are the accept path and connection close; broadcasts iterate a
/// snapshot taken under the read lock.
#[derive(Default)]
pub(crate) struct PeerSet {
    peers: RwLock<HashMap<u64, Peer>>,
    next_key: AtomicU64,
}

impl PeerSet {
    pub(crate) fn insert(&self, peer: Peer) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        write(&self.peers).insert(key, peer);
        key
    }

    pub(crate) fn remove(&self, key: u64) -> Option<Peer> {
        write(&self.peers).remove(&key)
    }

    pub(crate) fn snapshot(&self) -> Vec<Peer> {
        read(&self.peers).values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        read(&self.peers).len()
    }
}

/// Queue `frame` on every peer whose identity differs from `exclude`.
///
/// Peers that closed meanwhile are skipped. Returns how many peers the frame
/// was queued for.
pub(crate) fn fan_out(peers: &[Peer], frame: &Bytes, exclude: Option<&str>) -> usize {
    let mut delivered = 0;
    for peer in peers {
        if exclude.is_some_and(|excluded| peer.id() == excluded) {
            continue;
        }
        match peer.send_frame(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(PeerError::Closed) => debug!(peer = %peer.id(), "broadcast skipped closed peer"),
            Err(err) => warn!(peer = %peer.id(), error = %err, "broadcast skipped peer"),
        }
    }
    delivered
}

pub(crate) struct Router {
    ctx: Arc<Context>,
    /// Publication source of this router.
    instance: String,
    local: bool,
    pub(crate) peers: PeerSet,
    pubsub: Option<Arc<dyn PubSub>>,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl Router {
    /// `local` enables fan-out to this endpoint's own peers.
    pub(crate) fn new(ctx: Arc<Context>, local: bool, pubsub: Option<Arc<dyn PubSub>>) -> Self {
        Self {
            ctx,
            instance: uuid::Uuid::new_v4().to_string(),
            local,
            peers: PeerSet::default(),
            pubsub,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Whether broadcasting is possible at all.
    pub(crate) fn can_broadcast(&self) -> bool {
        self.local || self.pubsub.is_some()
    }

    /// Encode once, fan out locally, then publish to the backend.
    pub(crate) fn broadcast(&self, index: u8, record: &Record, exclude: Option<&PeerId>) -> Result<usize> {
        if !self.can_broadcast() {
            return Err(PeerError::Unsupported(
                "broadcast needs server mode or a pubsub backend",
            ));
        }
        let descriptor = self
            .ctx
            .table
            .by_index(index)
            .ok_or(SchemaError::UnknownSchema(index))?;
        let payload = descriptor.encode(self.ctx.identity.as_str(), record)?;
        let exclude = exclude.map(PeerId::as_str);

        let delivered = if self.local {
            let frame = Frame::new(index, payload.clone()).to_bytes();
            fan_out(&self.peers.snapshot(), &frame, exclude)
        } else {
            0
        };
        trace!(schema = descriptor.name(), delivered, ?exclude, "broadcast");

        if let Some(pubsub) = &self.pubsub {
            pubsub.publish(
                &topic_for(descriptor.name()),
                Publication {
                    origin: self.ctx.identity.to_string(),
                    source: self.instance.clone(),
                    exclude: exclude.map(str::to_string),
                    payload,
                },
            )?;
        }
        Ok(delivered)
    }

    /// Fan out a broadcast that arrived through the backend.
    ///
    /// Our own publications were already delivered locally and are skipped.
    pub(crate) fn relay(&self, index: u8, publication: Publication) -> usize {
        if publication.source == self.instance {
            return 0;
        }
        let Some(descriptor) = self.ctx.table.by_index(index) else {
            return 0;
        };
        let payload = match descriptor.restamp(publication.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    schema = descriptor.name(),
                    origin = %publication.origin,
                    error = %err,
                    "dropping undecodable publication"
                );
                return 0;
            }
        };
        let frame = Frame::new(index, payload).to_bytes();
        let delivered = fan_out(&self.peers.snapshot(), &frame, publication.exclude.as_deref());
        trace!(schema = descriptor.name(), origin = %publication.origin, delivered, "relay");
        delivered
    }

    /// Subscribe to every schema's topic. Handlers hold only a weak
    /// reference, so a dropped router stops relaying.
    pub(crate) fn subscribe(self: &Arc<Self>) -> Result<()> {
        let Some(pubsub) = &self.pubsub else {
            return Ok(());
        };
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for descriptor in self.ctx.table.descriptors() {
            let topic = topic_for(descriptor.name());
            let index = descriptor.index();
            let router: Weak<Router> = Arc::downgrade(self);
            let id = pubsub.subscribe(
                &topic,
                Arc::new(move |publication: Publication| {
                    if let Some(router) = router.upgrade() {
                        router.relay(index, publication);
                    }
                }),
            )?;
            subscriptions.push((topic, id));
        }
        Ok(())
    }

    pub(crate) fn unsubscribe(&self) {
        let Some(pubsub) = &self.pubsub else {
            return;
        };
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (topic, id) in subscriptions {
            if let Err(err) = pubsub.unsubscribe(&topic, id) {
                warn!(topic, error = %err, "unsubscribe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_schema::{SchemaMap, SchemaTable};
    use herald_transport::{memory, Connection};
    use serde_json::{json, Value};

    use super::*;
    use crate::pubsub::LocalPubSub;

    fn context(identity: &str) -> Arc<Context> {
        let schemas = SchemaMap::new().with("chat", json!({ "text": "string" }));
        Arc::new(Context {
            table: SchemaTable::build(&schemas).expect("schemas should build"),
            identity: PeerId::from(identity),
            multi_peer: true,
        })
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn attach(router: &Router, id: &str) -> Connection {
        let (local, remote) = memory::pair();
        let (info, sink, _events) = local.into_parts();
        router
            .peers
            .insert(Peer::new(PeerId::from(id), info, sink, Arc::clone(&router.ctx)));
        remote
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_identity() {
        let router = Router::new(context("server"), true, None);
        let mut a = attach(&router, "a");
        let mut b = attach(&router, "b");

        let delivered = router
            .broadcast(0, &record(json!({ "text": "hi" })), Some(&PeerId::from("a")))
            .expect("broadcast should succeed");
        assert_eq!(delivered, 1);

        let frame = b.events().next().await.expect("b should receive");
        assert_eq!(frame[0], 0);
        let (_, envelope) = router.ctx.table.decode(frame).unwrap();
        assert_eq!(envelope.get("text"), Some(&json!("hi")));

        a.sink().close();
        assert!(a.events().next().await.is_none(), "a must receive nothing");
    }

    #[tokio::test]
    async fn broadcast_without_exclusion_reaches_everyone() {
        let router = Router::new(context("server"), true, None);
        let _a = attach(&router, "a");
        let _b = attach(&router, "b");
        let delivered = router
            .broadcast(0, &record(json!({ "text": "all" })), None)
            .unwrap();
        assert_eq!(delivered, 2);
    }

    #[test]
    fn broadcast_unsupported_without_local_or_pubsub() {
        let router = Router::new(context("client"), false, None);
        assert!(matches!(
            router.broadcast(0, &record(json!({ "text": "x" })), None),
            Err(PeerError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn relay_honors_exclusion_and_skips_own_origin() {
        let bus = Arc::new(LocalPubSub::new());
        let first = Arc::new(Router::new(context("one"), true, Some(bus.clone() as Arc<dyn PubSub>)));
        let second = Arc::new(Router::new(context("two"), true, Some(bus.clone() as Arc<dyn PubSub>)));
        first.subscribe().unwrap();
        second.subscribe().unwrap();

        let mut local_a = attach(&first, "a");
        let mut remote_a = attach(&second, "a");
        let mut remote_b = attach(&second, "b");

        let delivered = first
            .broadcast(0, &record(json!({ "text": "hi" })), Some(&PeerId::from("a")))
            .unwrap();
        assert_eq!(delivered, 0);

        let frame = remote_b.events().next().await.expect("b should receive relay");
        let (_, envelope) = second.ctx.table.decode(frame).unwrap();
        assert_eq!(envelope.sender(), Some("one"));

        local_a.sink().close();
        remote_a.sink().close();
        assert!(local_a.events().next().await.is_none());
        assert!(remote_a.events().next().await.is_none());
    }

    #[tokio::test]
    async fn relay_reaches_endpoint_sharing_identity() {
        let bus = Arc::new(LocalPubSub::new());
        let first = Arc::new(Router::new(context("hub"), true, Some(bus.clone() as Arc<dyn PubSub>)));
        let second = Arc::new(Router::new(context("hub"), true, Some(bus.clone() as Arc<dyn PubSub>)));
        first.subscribe().unwrap();
        second.subscribe().unwrap();

        let mut near = attach(&first, "a");
        let mut far = attach(&second, "b");

        let delivered = first
            .broadcast(0, &record(json!({ "text": "hi" })), None)
            .unwrap();
        assert_eq!(delivered, 1);

        let frame = far.events().next().await.expect("far peer should receive relay");
        let (_, envelope) = second.ctx.table.decode(frame).unwrap();
        assert_eq!(envelope.get("text"), Some(&json!("hi")));

        near.events().next().await.expect("near peer should receive once");
        near.sink().close();
        assert!(near.events().next().await.is_none(), "no second copy for the near peer");
    }

    #[test]
    fn unsubscribe_removes_topics() {
        let bus = Arc::new(LocalPubSub::new());
        let router = Arc::new(Router::new(context("x"), true, Some(bus.clone() as Arc<dyn PubSub>)));
        router.subscribe().unwrap();
        assert_eq!(bus.subscriber_count("herald.chat"), 1);
        router.unsubscribe();
        assert_eq!(bus.subscriber_count("herald.chat"), 0);
    }
}
