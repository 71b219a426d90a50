use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use herald_frame::Frame;
use herald_schema::{Envelope, Record, SchemaDescriptor, SchemaError, SchemaTable};
use herald_transport::{ConnectionInfo, ConnectionSink, Query, TransportError};
use tracing::debug;

use crate::channel::Incoming;
use crate::error::{PeerError, Result};
use crate::handlers::{HandlerTable, MessageHandler};

/// Query parameter carrying a connecting client's identity.
pub const CLIENT_ID_PARAM: &str = "clientId";

/// Identity of one peer or endpoint. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PeerId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Codec state shared read-only by an endpoint and all of its peers.
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) table: SchemaTable,
    pub(crate) identity: PeerId,
    /// Whether decoded envelopes keep their sender identity.
    pub(crate) multi_peer: bool,
}

impl Context {
    pub(crate) fn descriptor(&self, name: &str) -> Result<&SchemaDescriptor> {
        self.table
            .by_name(name)
            .ok_or_else(|| PeerError::UnknownSchema(name.to_string()))
    }

    pub(crate) fn encode_frame(&self, index: u8, record: &Record) -> Result<Bytes> {
        let descriptor = self
            .table
            .by_index(index)
            .ok_or(SchemaError::UnknownSchema(index))?;
        Ok(descriptor.encode_frame(self.identity.as_str(), record)?)
    }

    fn decode(&self, raw: Bytes) -> std::result::Result<(u8, Envelope), SchemaError> {
        let (descriptor, envelope) = self.table.decode(raw)?;
        let envelope = if self.multi_peer {
            envelope
        } else {
            envelope.without_sender()
        };
        Ok((descriptor.index(), envelope))
    }
}

/// Callback run once when a peer's connection ends.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

enum CloseState {
    Open(Vec<CloseCallback>),
    Finished,
}

/// One live connection with its own identity.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: PeerId,
    info: ConnectionInfo,
    sink: ConnectionSink,
    ctx: Arc<Context>,
    handlers: HandlerTable,
    close_state: Mutex<CloseState>,
    announced: AtomicBool,
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        info: ConnectionInfo,
        sink: ConnectionSink,
        ctx: Arc<Context>,
    ) -> Self {
        let handlers = HandlerTable::new(ctx.table.len());
        Self {
            inner: Arc::new(PeerInner {
                id,
                info,
                sink,
                ctx,
                handlers,
                close_state: Mutex::new(CloseState::Open(Vec::new())),
                announced: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    /// Query parameters of the connection request.
    pub fn query(&self) -> &Query {
        self.inner.info.query()
    }

    /// Write one frame: the schema index followed by an encoded payload.
    pub fn send(&self, index: u8, payload: &[u8]) -> Result<()> {
        self.send_frame(Frame::new(index, Bytes::copy_from_slice(payload)).to_bytes())
    }

    pub(crate) fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.inner.sink.send(frame).map_err(|err| match err {
            TransportError::Closed => PeerError::Closed,
            other => PeerError::Transport(other),
        })
    }

    pub(crate) fn send_record(&self, index: u8, record: &Record) -> Result<()> {
        let frame = self.inner.ctx.encode_frame(index, record)?;
        self.send_frame(frame)
    }

    /// Schema channel bound to this connection only.
    pub fn channel(&self, name: &str) -> Result<PeerChannel> {
        let index = self.inner.ctx.descriptor(name)?.index();
        Ok(PeerChannel {
            peer: self.clone(),
            index,
        })
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.sink.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sink.is_closed()
    }

    /// Resolves once the connection has ended and messages queued before
    /// the close were written out.
    pub async fn closed(&self) {
        self.inner.sink.finished().await
    }

    /// Run `callback` once when the connection ends, by either side.
    ///
    /// Runs immediately if the connection has already ended.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self
            .inner
            .close_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let CloseState::Open(callbacks) = &mut *state {
            callbacks.push(Box::new(callback));
            return;
        }
        drop(state);
        callback();
    }

    /// Demultiplex one inbound buffer by its leading schema index.
    pub(crate) fn receive(&self, raw: Bytes) -> std::result::Result<(u8, Envelope), SchemaError> {
        self.inner.ctx.decode(raw)
    }

    pub(crate) fn handler(&self, index: u8) -> Option<MessageHandler> {
        self.inner.handlers.get(index)
    }

    pub(crate) fn schema_name(&self, index: u8) -> &str {
        self.inner
            .ctx
            .table
            .by_index(index)
            .map_or("", SchemaDescriptor::name)
    }

    /// `true` the first time only.
    pub(crate) fn mark_announced(&self) -> bool {
        !self.inner.announced.swap(true, Ordering::AcqRel)
    }

    /// Connection ended: run close callbacks exactly once.
    pub(crate) fn finish(&self) {
        let callbacks = {
            let mut state = self
                .inner
                .close_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, CloseState::Finished) {
                CloseState::Open(callbacks) => callbacks,
                CloseState::Finished => return,
            }
        };
        self.inner.sink.close();
        self.inner.handlers.clear();
        debug!(peer = %self.inner.id, "peer closed");
        for callback in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.info.remote())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A schema channel scoped to one connection.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    peer: Peer,
    index: u8,
}

impl PeerChannel {
    pub fn name(&self) -> &str {
        self.peer.schema_name(self.index)
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Encode `record` and send it to this peer.
    pub fn send(&self, record: &Record) -> Result<()> {
        self.peer.send_record(self.index, record)
    }

    /// Replace this connection's handler for the schema.
    ///
    /// While set, it receives this peer's messages instead of the
    /// endpoint-level handler.
    pub fn on_message(&self, handler: impl Fn(Incoming) + Send + Sync + 'static) {
        self.peer.inner.handlers.set(self.index, Arc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use herald_schema::SchemaMap;
    use herald_transport::memory;
    use serde_json::{json, Value};

    use super::*;

    fn context(multi_peer: bool) -> Arc<Context> {
        let schemas = SchemaMap::new()
            .with("chat", json!({ "text": "string" }))
            .with("ping", json!({ "n": "varuint" }));
        Arc::new(Context {
            table: SchemaTable::build(&schemas).expect("schemas should build"),
            identity: PeerId::from("local"),
            multi_peer,
        })
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn peer_pair(multi_peer: bool) -> (Peer, herald_transport::Connection) {
        let (local, remote) = memory::pair();
        let (info, sink, _events) = local.into_parts();
        (Peer::new(PeerId::from("p1"), info, sink, context(multi_peer)), remote)
    }

    #[test]
    fn peer_id_comparisons() {
        let id = PeerId::from("abc");
        assert_eq!(id, "abc");
        assert_eq!(id.to_string(), "abc");
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[tokio::test]
    async fn send_writes_index_then_payload() {
        let (peer, mut remote) = peer_pair(false);
        peer.send(1, &[0xAA, 0xBB]).expect("send should enqueue");
        let frame = remote.events().next().await.expect("frame should arrive");
        assert_eq!(frame.as_ref(), &[1, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn receive_strips_sender_in_single_peer_mode() {
        let (peer, _remote) = peer_pair(false);
        let frame = peer
            .inner
            .ctx
            .encode_frame(0, &record(json!({ "text": "hi" })))
            .unwrap();

        let (index, envelope) = peer.receive(frame).expect("frame should decode");
        assert_eq!(index, 0);
        assert_eq!(envelope.sender(), None);
        assert_eq!(envelope.get("text"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn receive_keeps_sender_in_multi_peer_mode() {
        let (peer, _remote) = peer_pair(true);
        let frame = peer
            .inner
            .ctx
            .encode_frame(1, &record(json!({ "n": 3 })))
            .unwrap();
        let (_, envelope) = peer.receive(frame).unwrap();
        assert_eq!(envelope.sender(), Some("local"));
    }

    #[tokio::test]
    async fn receive_rejects_unknown_index() {
        let (peer, _remote) = peer_pair(false);
        let err = peer.receive(Bytes::from_static(&[7, 0])).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownSchema(7)));
    }

    #[tokio::test]
    async fn close_callbacks_run_exactly_once() {
        let (peer, _remote) = peer_pair(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        peer.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        peer.close();
        peer.close();
        peer.finish();
        peer.finish();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(peer.is_closed());

        let counter = Arc::clone(&count);
        peer.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (peer, _remote) = peer_pair(false);
        peer.close();
        assert!(matches!(peer.send(0, &[]), Err(PeerError::Closed)));
    }

    #[tokio::test]
    async fn channel_lookup() {
        let (peer, _remote) = peer_pair(false);
        let channel = peer.channel("ping").expect("ping should exist");
        assert_eq!(channel.index(), 1);
        assert_eq!(channel.name(), "ping");
        assert!(matches!(
            peer.channel("missing"),
            Err(PeerError::UnknownSchema(_))
        ));
    }

    #[test]
    fn announce_only_once() {
        let (peer, _remote) = peer_pair(false);
        assert!(peer.mark_announced());
        assert!(!peer.mark_announced());
    }
}
