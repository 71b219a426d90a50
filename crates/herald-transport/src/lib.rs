//! Duplex connection transports.
//!
//! Every transport produces the same [`Connection`] value: connection
//! metadata, a non-blocking outbound sink and an inbound event stream.
//! Servers hand accepted connections out through a [`ServerHandle`].
//!
//! - [`memory`]: in-process pairs, used for tests and embedding
//! - [`unix`]: Unix domain sockets with length-prefixed framing (Linux/macOS)
//! - [`ws`]: WebSocket binary messages over TCP

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod remote;
pub mod server;
pub mod ws;

#[cfg(unix)]
pub mod unix;

mod driver;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionEvents, ConnectionInfo, ConnectionSink, Query};
pub use error::{Result, TransportError};
pub use handshake::HandshakeConfig;
pub use memory::MemoryConnector;
pub use remote::{bind, Address, Remote};
pub use server::ServerHandle;
