//! Endpoint: the root object owning the schema table, its peers and the
//! schema channels.

use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use herald_schema::{SchemaError, SchemaTable};
use herald_transport::ConnectionEvents;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::channel::{Incoming, SchemaChannel};
use crate::client::ClientEndpoint;
use crate::config::{EndpointConfig, Role};
use crate::error::Result;
use crate::handlers::{read, write, HandlerTable};
use crate::peer::{Context, Peer, PeerId};
use crate::router::Router;
use crate::server::ServerEndpoint;

/// An inbound message that could not be decoded and was dropped.
#[derive(Debug)]
pub struct DecodeError {
    /// Connection the message arrived on.
    pub peer: PeerId,
    /// Leading byte of the message, if there was one.
    pub discriminator: Option<u8>,
    pub error: SchemaError,
}

/// Observer for dropped messages.
pub type DecodeErrorHandler = Arc<dyn Fn(&DecodeError) + Send + Sync>;

/// State shared by an endpoint, its channels and its reader tasks.
pub(crate) struct Shared {
    pub(crate) ctx: Arc<Context>,
    pub(crate) handlers: HandlerTable,
    decode_errors: RwLock<Option<DecodeErrorHandler>>,
    pub(crate) router: Arc<Router>,
    closed: CancellationToken,
}

impl Shared {
    pub(crate) fn new(ctx: Arc<Context>, router: Arc<Router>) -> Self {
        Self {
            handlers: HandlerTable::new(ctx.table.len()),
            ctx,
            decode_errors: RwLock::new(None),
            router,
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn channel_index(&self, name: &str) -> Result<u8> {
        Ok(self.ctx.descriptor(name)?.index())
    }

    pub(crate) fn set_decode_error_handler(&self, handler: DecodeErrorHandler) {
        *write(&self.decode_errors) = Some(handler);
    }

    /// Decode one inbound message and hand it to its schema's handler.
    ///
    /// Undecodable messages are reported and dropped; the connection stays
    /// open.
    pub(crate) fn dispatch(&self, peer: &Peer, raw: Bytes) {
        let discriminator = raw.first().copied();
        match peer.receive(raw) {
            Ok((index, envelope)) => {
                match peer.handler(index).or_else(|| self.handlers.get(index)) {
                    Some(handler) => handler(Incoming::new(envelope, peer.clone())),
                    None => trace!(peer = %peer.id(), schema_index = index, "no handler, message dropped"),
                }
            }
            Err(error) => {
                warn!(
                    peer = %peer.id(),
                    schema_index = ?discriminator,
                    error = %error,
                    "dropping undecodable message"
                );
                let handler = read(&self.decode_errors).clone();
                if let Some(handler) = handler {
                    handler(&DecodeError {
                        peer: peer.id().clone(),
                        discriminator,
                        error,
                    });
                }
            }
        }
    }

    /// Pump `events` into [`Shared::dispatch`] until the connection ends,
    /// then evict the peer (by its live-set key) and run its close callbacks.
    pub(crate) fn spawn_reader(self: &Arc<Self>, peer: Peer, mut events: ConnectionEvents, key: Option<u64>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = events.next().await {
                shared.dispatch(&peer, raw);
            }
            if let Some(key) = key {
                shared.router.peers.remove(key);
            }
            peer.finish();
        });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Stop relaying, close every live peer and drop all handlers.
    /// Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.router.unsubscribe();
        for peer in self.router.peers.snapshot() {
            peer.close();
        }
        self.handlers.clear();
        *write(&self.decode_errors) = None;
    }
}

/// A client or server endpoint, selected by [`EndpointConfig`].
#[derive(Debug)]
pub enum Endpoint {
    Client(ClientEndpoint),
    Server(ServerEndpoint),
}

impl Endpoint {
    /// Validate `config` and start the endpoint.
    ///
    /// Client mode connects to the remote before returning. Server mode
    /// starts accepting on the supplied server handle and returns at once.
    pub async fn open(config: EndpointConfig) -> Result<Self> {
        let plan = config.into_plan()?;
        match plan.role {
            Role::Client(remote) => Ok(Self::Client(
                ClientEndpoint::connect(remote, plan.setup).await?,
            )),
            Role::Server(server) => Ok(Self::Server(ServerEndpoint::start(server, plan.setup)?)),
        }
    }

    /// This endpoint's own identity.
    pub fn identity(&self) -> &PeerId {
        match self {
            Self::Client(client) => client.identity(),
            Self::Server(server) => server.identity(),
        }
    }

    /// Channel for the schema called `name`.
    pub fn channel(&self, name: &str) -> Result<SchemaChannel> {
        match self {
            Self::Client(client) => client.channel(name),
            Self::Server(server) => server.channel(name),
        }
    }

    pub fn schemas(&self) -> &SchemaTable {
        match self {
            Self::Client(client) => client.schemas(),
            Self::Server(server) => server.schemas(),
        }
    }

    /// Observe messages dropped because they could not be decoded.
    pub fn on_decode_error(&self, handler: impl Fn(&DecodeError) + Send + Sync + 'static) {
        match self {
            Self::Client(client) => client.on_decode_error(handler),
            Self::Server(server) => server.on_decode_error(handler),
        }
    }

    /// Close every owned peer. The endpoint is unusable afterwards.
    pub fn close(&self) {
        match self {
            Self::Client(client) => client.close(),
            Self::Server(server) => server.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Client(client) => client.is_closed(),
            Self::Server(server) => server.is_closed(),
        }
    }

    pub fn as_client(&self) -> Option<&ClientEndpoint> {
        match self {
            Self::Client(client) => Some(client),
            Self::Server(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerEndpoint> {
        match self {
            Self::Server(server) => Some(server),
            Self::Client(_) => None,
        }
    }

    pub fn into_client(self) -> Option<ClientEndpoint> {
        match self {
            Self::Client(client) => Some(client),
            Self::Server(_) => None,
        }
    }

    pub fn into_server(self) -> Option<ServerEndpoint> {
        match self {
            Self::Server(server) => Some(server),
            Self::Client(_) => None,
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("identity", &self.ctx.identity)
            .field("schemas", &self.ctx.table.len())
            .field("peers", &self.router.peers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use herald_schema::{Record, SchemaMap};
    use herald_transport::{memory, Connection};
    use serde_json::{json, Value};

    use super::*;

    fn shared() -> Arc<Shared> {
        let schemas = SchemaMap::new()
            .with("a", json!({ "x": "varuint" }))
            .with("b", json!({ "y": "string" }));
        let ctx = Arc::new(Context {
            table: SchemaTable::build(&schemas).expect("schemas should build"),
            identity: PeerId::from("server"),
            multi_peer: true,
        });
        let router = Arc::new(Router::new(Arc::clone(&ctx), true, None));
        Arc::new(Shared::new(ctx, router))
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn peer(shared: &Shared) -> (Peer, Connection) {
        let (local, remote) = memory::pair();
        let (info, sink, _events) = local.into_parts();
        (
            Peer::new(PeerId::from("p"), info, sink, Arc::clone(&shared.ctx)),
            remote,
        )
    }

    #[tokio::test]
    async fn interleaved_frames_reach_their_own_handlers() {
        let shared = shared();
        let (peer, _remote) = peer(&shared);
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen_a);
        shared.handlers.set(
            0,
            Arc::new(move |msg: Incoming| sink.lock().unwrap().push(msg.get("x").cloned())),
        );
        let sink = Arc::clone(&seen_b);
        shared.handlers.set(
            1,
            Arc::new(move |msg: Incoming| sink.lock().unwrap().push(msg.get("y").cloned())),
        );

        let frames = [
            shared.ctx.encode_frame(0, &record(json!({ "x": 1 }))).unwrap(),
            shared.ctx.encode_frame(1, &record(json!({ "y": "one" }))).unwrap(),
            shared.ctx.encode_frame(1, &record(json!({ "y": "two" }))).unwrap(),
            shared.ctx.encode_frame(0, &record(json!({ "x": 2 }))).unwrap(),
        ];
        for frame in frames {
            shared.dispatch(&peer, frame);
        }

        assert_eq!(*seen_a.lock().unwrap(), vec![Some(json!(1)), Some(json!(2))]);
        assert_eq!(
            *seen_b.lock().unwrap(),
            vec![Some(json!("one")), Some(json!("two"))]
        );
    }

    #[tokio::test]
    async fn unknown_discriminator_is_reported_and_dropped() {
        let shared = shared();
        let (peer, _remote) = peer(&shared);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        shared.set_decode_error_handler(Arc::new(move |err: &DecodeError| {
            sink.lock().unwrap().push((err.peer.clone(), err.discriminator));
        }));
        let delivered = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&delivered);
        shared
            .handlers
            .set(0, Arc::new(move |_: Incoming| *counter.lock().unwrap() += 1));

        shared.dispatch(&peer, Bytes::from_static(&[9, 1, 2, 3]));
        shared.dispatch(&peer, Bytes::new());
        shared.dispatch(&peer, shared.ctx.encode_frame(0, &record(json!({ "x": 7 }))).unwrap());

        assert_eq!(
            *errors.lock().unwrap(),
            vec![(PeerId::from("p"), Some(9)), (PeerId::from("p"), None)]
        );
        assert_eq!(*delivered.lock().unwrap(), 1);
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn per_peer_handler_takes_precedence() {
        let shared = shared();
        let (peer, _remote) = peer(&shared);
        let hits = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&hits);
        shared
            .handlers
            .set(0, Arc::new(move |_: Incoming| sink.lock().unwrap().push("endpoint")));
        let sink = Arc::clone(&hits);
        peer.channel("a")
            .unwrap()
            .on_message(move |_| sink.lock().unwrap().push("peer"));

        shared.dispatch(&peer, shared.ctx.encode_frame(0, &record(json!({ "x": 1 }))).unwrap());
        assert_eq!(*hits.lock().unwrap(), vec!["peer"]);
    }

    #[tokio::test]
    async fn reader_evicts_peer_on_close() {
        let shared = shared();
        let (local, remote) = memory::pair();
        let (info, sink, events) = local.into_parts();
        let peer = Peer::new(PeerId::from("p"), info, sink, Arc::clone(&shared.ctx));
        let key = shared.router.peers.insert(peer.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        peer.on_close(move || {
            let _ = tx.send(());
        });
        shared.spawn_reader(peer, events, Some(key));
        assert_eq!(shared.router.peers.len(), 1);

        remote.sink().close();
        rx.await.expect("close callback should run");
        assert_eq!(shared.router.peers.len(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_peers() {
        let shared = shared();
        let (peer, _remote) = peer(&shared);
        shared.router.peers.insert(peer.clone());

        shared.close();
        shared.close();
        assert!(shared.is_closed());
        assert!(peer.is_closed());
        assert!(shared.handlers.get(0).is_none());
    }
}
