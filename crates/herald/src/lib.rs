//! Schema-typed binary messaging over one duplex connection.
//!
//! Every message is a 1-byte schema index followed by a compact binary
//! record. A server endpoint broadcasts to its peers with identity-based
//! exclusion, optionally relayed through a pub/sub backend to peers of
//! other endpoints.
//!
//! # Crate Structure
//!
//! - [`frame`]: discriminator frames and stream framing
//! - [`schema`]: field specs, record codecs and the schema table
//! - [`transport`]: in-memory, Unix socket and WebSocket connections
//! - [`peer`]: endpoints, peers, schema channels and pub/sub (behind `peer` feature)

/// Re-export frame types.
pub mod frame {
    pub use herald_frame::*;
}

/// Re-export schema types.
pub mod schema {
    pub use herald_schema::*;
}

/// Re-export transport types.
pub mod transport {
    pub use herald_transport::*;
}

/// Re-export endpoint types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use herald_peer::*;
}

#[cfg(feature = "peer")]
pub use herald_peer::{
    ClientEndpoint, Endpoint, EndpointConfig, Incoming, LocalPubSub, Peer, PeerError, PeerId,
    PubSub, SchemaChannel, ServerEndpoint,
};
pub use herald_schema::{Record, SchemaMap};
