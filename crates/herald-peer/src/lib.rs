//! Typed, multiplexed messaging over a single duplex connection.
//!
//! An [`Endpoint`] owns a schema table and either one connection to a
//! server ([`ClientEndpoint`]) or every connection accepted by a server
//! ([`ServerEndpoint`]). Each schema is used through a [`SchemaChannel`];
//! broadcasts fan out to live peers and, with a [`PubSub`] backend
//! attached, to peers of other endpoints.

pub mod channel;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod peer;
pub mod pubsub;
pub mod server;

mod handlers;
mod router;

pub use channel::{Incoming, SchemaChannel};
pub use client::ClientEndpoint;
pub use config::EndpointConfig;
pub use endpoint::{DecodeError, DecodeErrorHandler, Endpoint};
pub use error::{ConfigError, PeerError, Result};
pub use handlers::MessageHandler;
pub use peer::{CloseCallback, Peer, PeerChannel, PeerId, CLIENT_ID_PARAM};
pub use pubsub::{topic_for, LocalPubSub, PubSub, Publication, PublicationHandler, SubscriptionId};
pub use server::ServerEndpoint;
