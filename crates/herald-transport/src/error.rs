use std::path::PathBuf;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The address could not be parsed.
    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The address scheme does not name a known transport.
    #[error("unsupported transport scheme '{0}'")]
    UnsupportedScheme(String),

    /// The connect handshake was rejected or malformed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Stream framing error.
    #[error("frame error: {0}")]
    Frame(#[from] herald_frame::FrameError),

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Listening requires a running tokio runtime.
    #[error("no tokio runtime available to host the server")]
    NoRuntime,

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
