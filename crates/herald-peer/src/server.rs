use std::fmt;
use std::sync::{Arc, RwLock};

use herald_schema::SchemaTable;
use herald_transport::{Connection, ServerHandle};
use tracing::{debug, info};

use crate::channel::SchemaChannel;
use crate::config::Setup;
use crate::endpoint::{DecodeError, Shared};
use crate::error::{ConfigError, Result};
use crate::handlers::{read, write};
use crate::peer::{Context, Peer, PeerId, CLIENT_ID_PARAM};
use crate::router::Router;

type ConnectionHandler = Arc<dyn Fn(Peer) + Send + Sync>;

/// Endpoint accepting any number of peers from a [`ServerHandle`].
///
/// Dropping it stops accepting and closes every live peer.
pub struct ServerEndpoint {
    state: Arc<ServerState>,
}

struct ServerState {
    shared: Arc<Shared>,
    on_connection: RwLock<Option<ConnectionHandler>>,
    local_addr: String,
}

impl ServerEndpoint {
    pub(crate) fn start(server: ServerHandle, setup: Setup) -> Result<Self> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConfigError::ServerUnavailable)?;
        let Setup {
            table,
            identity,
            pubsub,
            ..
        } = setup;

        let ctx = Arc::new(Context {
            table,
            identity,
            multi_peer: true,
        });
        let router = Arc::new(Router::new(Arc::clone(&ctx), true, pubsub));
        router.subscribe()?;

        let state = Arc::new(ServerState {
            shared: Arc::new(Shared::new(ctx, router)),
            on_connection: RwLock::new(None),
            local_addr: server.local_addr().to_string(),
        });
        info!(addr = %state.local_addr, identity = %state.shared.ctx.identity, "server endpoint listening");
        runtime.spawn(accept_loop(server, Arc::clone(&state)));
        Ok(Self { state })
    }

    pub fn identity(&self) -> &PeerId {
        &self.state.shared.ctx.identity
    }

    /// Address the underlying server was bound to.
    pub fn local_addr(&self) -> &str {
        &self.state.local_addr
    }

    /// Run `callback` for every accepted peer, before any of its messages
    /// are dispatched.
    ///
    /// Peers that connected before registration are announced right away.
    /// Each peer is announced at most once.
    pub fn on_connection(&self, callback: impl Fn(Peer) + Send + Sync + 'static) {
        *write(&self.state.on_connection) = Some(Arc::new(callback));
        for peer in self.state.shared.router.peers.snapshot() {
            self.state.announce(&peer);
        }
    }

    /// Snapshot of the live peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.state.shared.router.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.state.shared.router.peers.len()
    }

    /// Channel for `name` across every current and future peer.
    pub fn channel(&self, name: &str) -> Result<SchemaChannel> {
        let index = self.state.shared.channel_index(name)?;
        Ok(SchemaChannel::new(Arc::clone(&self.state.shared), index, None))
    }

    pub fn schemas(&self) -> &SchemaTable {
        &self.state.shared.ctx.table
    }

    pub fn on_decode_error(&self, handler: impl Fn(&DecodeError) + Send + Sync + 'static) {
        self.state.shared.set_decode_error_handler(Arc::new(handler));
    }

    /// Stop accepting and close every live peer. Idempotent.
    pub fn close(&self) {
        if !self.state.shared.is_closed() {
            info!(addr = %self.state.local_addr, "server endpoint closing");
        }
        self.state.shared.close();
        *write(&self.state.on_connection) = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.shared.is_closed()
    }
}

impl ServerState {
    fn admit(&self, conn: Connection) {
        let (conn_info, sink, events) = conn.into_parts();
        let id = conn_info
            .query_param(CLIENT_ID_PARAM)
            .filter(|id| !id.is_empty())
            .map_or_else(PeerId::generate, PeerId::from);
        let peer = Peer::new(id, conn_info, sink, Arc::clone(&self.shared.ctx));
        let key = self.shared.router.peers.insert(peer.clone());

        // Checked after the insert: a close racing with us either sees the
        // peer in its snapshot or is seen here.
        if self.shared.is_closed() {
            self.shared.router.peers.remove(key);
            peer.close();
            debug!(peer = %peer.id(), "refused peer on closed endpoint");
            return;
        }
        debug!(peer = %peer.id(), remote = peer.info().remote(), "peer connected");

        self.announce(&peer);
        self.shared.spawn_reader(peer, events, Some(key));
    }

    fn announce(&self, peer: &Peer) {
        let handler = read(&self.on_connection).clone();
        if let Some(handler) = handler {
            if peer.mark_announced() {
                handler(peer.clone());
            }
        }
    }
}

async fn accept_loop(mut server: ServerHandle, state: Arc<ServerState>) {
    let closed = state.shared.closed_token().clone();
    loop {
        let conn = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            conn = server.accept() => conn,
        };
        match conn {
            Some(conn) => state.admit(conn),
            None => break,
        }
    }
    server.shutdown();
    debug!(addr = %state.local_addr, "accept loop stopped");
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("identity", self.identity())
            .field("local_addr", &self.state.local_addr)
            .field("peers", &self.peer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
