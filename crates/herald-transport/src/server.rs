use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

/// Accepted connections waiting for the server owner.
pub const ACCEPT_BACKLOG: usize = 128;

/// A listening server: a queue of accepted connections plus a shutdown
/// token that stops the accept loop.
///
/// Dropping the handle shuts the server down.
#[derive(Debug)]
pub struct ServerHandle {
    incoming: mpsc::Receiver<Connection>,
    shutdown: CancellationToken,
    local_addr: String,
}

impl ServerHandle {
    pub(crate) fn channel(local_addr: impl Into<String>) -> (Acceptor, ServerHandle) {
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown = CancellationToken::new();
        let acceptor = Acceptor {
            tx,
            shutdown: shutdown.clone(),
        };
        let handle = ServerHandle {
            incoming,
            shutdown,
            local_addr: local_addr.into(),
        };
        (acceptor, handle)
    }

    /// Next accepted connection, or `None` after shutdown.
    pub async fn accept(&mut self) -> Option<Connection> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            conn = self.incoming.recv() => conn,
        }
    }

    /// Stop accepting. Already-accepted connections are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Address the server is reachable at, e.g. `ws://127.0.0.1:4000`.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Producer side of a [`ServerHandle`], owned by an accept loop.
#[derive(Debug, Clone)]
pub(crate) struct Acceptor {
    tx: mpsc::Sender<Connection>,
    shutdown: CancellationToken,
}

impl Acceptor {
    /// Hand a connection to the server owner. Returns `false` once the
    /// server is gone; the connection is closed in that case.
    pub(crate) async fn deliver(&self, conn: Connection) -> bool {
        if self.shutdown.is_cancelled() {
            conn.sink().close();
            return false;
        }
        match self.tx.send(conn).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(conn)) => {
                conn.sink().close();
                false
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
