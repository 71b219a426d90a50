use std::fmt;
use std::sync::Arc;

use herald_schema::{Envelope, Record};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::endpoint::Shared;
use crate::error::{PeerError, Result};
use crate::peer::{Peer, PeerId};

/// A decoded inbound message and the peer it came from.
pub struct Incoming {
    envelope: Envelope,
    peer: Peer,
}

impl Incoming {
    pub(crate) fn new(envelope: Envelope, peer: Peer) -> Self {
        Self { envelope, peer }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Application fields of the message.
    pub fn record(&self) -> &Record {
        self.envelope.record()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.envelope.get(field)
    }

    /// Sender identity carried in the message (multi-peer mode only).
    pub fn sender(&self) -> Option<&str> {
        self.envelope.sender()
    }

    pub fn schema_index(&self) -> u8 {
        self.envelope.schema_index()
    }

    pub fn schema_name(&self) -> &str {
        self.peer.schema_name(self.envelope.schema_index())
    }

    /// The connection the message arrived on.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peer_id(&self) -> &PeerId {
        self.peer.id()
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(self.envelope.deserialize()?)
    }

    /// Send `record` back to the originating peer on the same schema.
    pub fn reply(&self, record: &Record) -> Result<()> {
        self.peer.send_record(self.envelope.schema_index(), record)
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("schema", &self.schema_name())
            .field("peer", self.peer.id())
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Typed front-end for one schema on an endpoint.
///
/// On a client endpoint it is bound to the single connection; on a server
/// endpoint it covers every current and future peer.
#[derive(Clone)]
pub struct SchemaChannel {
    shared: Arc<Shared>,
    index: u8,
    peer: Option<Peer>,
}

impl SchemaChannel {
    pub(crate) fn new(shared: Arc<Shared>, index: u8, peer: Option<Peer>) -> Self {
        Self {
            shared,
            index,
            peer,
        }
    }

    pub fn name(&self) -> &str {
        self.shared
            .ctx
            .table
            .by_index(self.index)
            .map_or("", |descriptor| descriptor.name())
    }

    /// Wire index of this schema.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Replace the handler for this schema. Later registrations win.
    pub fn on_message(&self, handler: impl Fn(Incoming) + Send + Sync + 'static) {
        self.shared.handlers.set(self.index, Arc::new(handler));
    }

    /// Encode `record` and send it over the client connection.
    ///
    /// Server channels have no single target; use [`SchemaChannel::send_to`],
    /// [`Peer::channel`] or [`Incoming::reply`] there.
    pub fn send(&self, record: &Record) -> Result<()> {
        match &self.peer {
            Some(peer) => peer.send_record(self.index, record),
            None => Err(PeerError::Unsupported(
                "send on a server channel needs a target peer",
            )),
        }
    }

    /// Encode `record` and send it to one peer.
    pub fn send_to(&self, peer: &Peer, record: &Record) -> Result<()> {
        peer.send_record(self.index, record)
    }

    /// Deliver `record` to every live peer except `exclude`, and publish it
    /// to the pub/sub backend when one is attached.
    ///
    /// Returns how many local peers the message was queued for.
    pub fn broadcast(&self, record: &Record, exclude: Option<&PeerId>) -> Result<usize> {
        if self.shared.is_closed() {
            return Err(PeerError::Closed);
        }
        self.shared.router.broadcast(self.index, record, exclude)
    }
}

impl fmt::Debug for SchemaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaChannel")
            .field("name", &self.name())
            .field("index", &self.index)
            .finish()
    }
}
