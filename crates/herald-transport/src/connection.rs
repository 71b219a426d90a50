use std::collections::BTreeMap;

use bytes::Bytes;
use herald_frame::FrameError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};

/// Query parameters carried on the connection request.
pub type Query = BTreeMap<String, String>;

/// Metadata about one established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    query: Query,
    remote: String,
}

impl ConnectionInfo {
    pub fn new(query: Query, remote: impl Into<String>) -> Self {
        Self {
            query,
            remote: remote.into(),
        }
    }

    /// Query parameters of the connection request.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Look up one query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Human-readable description of the other end.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

/// Outbound half of a connection.
///
/// Cloneable; all clones write to the same connection in call order.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
    finished: CancellationToken,
    max_message_size: usize,
}

impl ConnectionSink {
    /// `finished` is cancelled once the transport has written everything
    /// queued before the close.
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        closed: CancellationToken,
        finished: CancellationToken,
    ) -> Self {
        Self {
            tx,
            closed,
            finished,
            max_message_size: usize::MAX,
        }
    }

    /// Reject messages larger than `max` at enqueue time.
    pub(crate) fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Largest message the transport accepts.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Enqueue one message. Returns without waiting for delivery.
    ///
    /// A message over [`max_message_size`](Self::max_message_size) fails
    /// with [`FrameError::PayloadTooLarge`] and leaves the connection open.
    pub fn send(&self, message: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if message.len() > self.max_message_size {
            return Err(TransportError::Frame(FrameError::PayloadTooLarge {
                size: message.len(),
                max: self.max_message_size,
            }));
        }
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Resolves once the connection is closed and queued messages have
    /// been handed to the transport.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

/// Inbound half of a connection.
#[derive(Debug)]
pub struct ConnectionEvents {
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
}

impl ConnectionEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Bytes>, closed: CancellationToken) -> Self {
        Self { rx, closed }
    }

    /// Next received message, or `None` once the connection has closed.
    ///
    /// Messages that arrived before the close are still yielded.
    pub async fn next(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.closed.cancelled() => None,
        }
    }
}

/// One established duplex connection.
#[derive(Debug)]
pub struct Connection {
    info: ConnectionInfo,
    sink: ConnectionSink,
    events: ConnectionEvents,
}

impl Connection {
    pub(crate) fn new(info: ConnectionInfo, sink: ConnectionSink, events: ConnectionEvents) -> Self {
        Self { info, sink, events }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn sink(&self) -> &ConnectionSink {
        &self.sink
    }

    pub fn events(&mut self) -> &mut ConnectionEvents {
        &mut self.events
    }

    /// Split into metadata, outbound and inbound halves.
    pub fn into_parts(self) -> (ConnectionInfo, ConnectionSink, ConnectionEvents) {
        (self.info, self.sink, self.events)
    }
}
