//! In-process transport.
//!
//! Both halves of a pair share one close token, so closing either side
//! ends the other side's event stream once its queue drains.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{Connection, ConnectionEvents, ConnectionInfo, ConnectionSink, Query};
use crate::error::{Result, TransportError};
use crate::server::{Acceptor, ServerHandle};

/// Remote description used for in-memory connections.
pub const MEMORY_REMOTE: &str = "memory";

/// Create a connected pair with empty query parameters.
pub fn pair() -> (Connection, Connection) {
    pair_with_query(Query::new())
}

/// Create a connected pair; both sides see `query` as the request query.
pub fn pair_with_query(query: Query) -> (Connection, Connection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let a = Connection::new(
        ConnectionInfo::new(query.clone(), MEMORY_REMOTE),
        ConnectionSink::new(a_tx, closed.clone(), closed.clone()),
        ConnectionEvents::new(a_rx, closed.clone()),
    );
    let b = Connection::new(
        ConnectionInfo::new(query, MEMORY_REMOTE),
        ConnectionSink::new(b_tx, closed.clone(), closed.clone()),
        ConnectionEvents::new(b_rx, closed),
    );
    (a, b)
}

/// Create an in-memory server and a connector that dials it.
pub fn server() -> (ServerHandle, MemoryConnector) {
    let (acceptor, handle) = ServerHandle::channel(MEMORY_REMOTE);
    (handle, MemoryConnector { acceptor })
}

/// Dials an in-memory server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    acceptor: Acceptor,
}

impl MemoryConnector {
    /// Open a connection; the server side sees `query`.
    pub async fn connect(&self, query: Query) -> Result<Connection> {
        if self.acceptor.is_shutdown() {
            return Err(TransportError::Shutdown);
        }
        let (client, server) = pair_with_query(query);
        if !self.acceptor.deliver(server).await {
            return Err(TransportError::Shutdown);
        }
        debug!("memory connection established");
        Ok(client)
    }
}
