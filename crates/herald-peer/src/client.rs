use std::fmt;
use std::sync::Arc;

use herald_schema::SchemaTable;
use herald_transport::Remote;
use tracing::info;

use crate::channel::SchemaChannel;
use crate::config::Setup;
use crate::endpoint::{DecodeError, Shared};
use crate::error::Result;
use crate::peer::{Context, Peer, PeerId};
use crate::router::Router;

/// Endpoint with exactly one connection, to a remote server.
///
/// Dropping it closes the connection.
pub struct ClientEndpoint {
    shared: Arc<Shared>,
    peer: Peer,
}

impl ClientEndpoint {
    pub(crate) async fn connect(remote: Remote, setup: Setup) -> Result<Self> {
        let Setup {
            table,
            identity,
            query,
            pubsub,
            transport,
        } = setup;

        let conn = remote.connect(&query, &transport).await?;
        let (conn_info, sink, events) = conn.into_parts();
        info!(remote = conn_info.remote(), identity = %identity, "connected");

        let ctx = Arc::new(Context {
            table,
            identity: identity.clone(),
            multi_peer: pubsub.is_some(),
        });
        // Publish-only: a client has no local peers to relay into.
        let router = Arc::new(Router::new(Arc::clone(&ctx), false, pubsub));
        let shared = Arc::new(Shared::new(ctx, router));

        let peer = Peer::new(identity, conn_info, sink, Arc::clone(&shared.ctx));
        shared.spawn_reader(peer.clone(), events, None);
        Ok(Self { shared, peer })
    }

    pub fn identity(&self) -> &PeerId {
        &self.shared.ctx.identity
    }

    /// The single connection to the server.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Channel for `name`, bound to the server connection.
    pub fn channel(&self, name: &str) -> Result<SchemaChannel> {
        let index = self.shared.channel_index(name)?;
        Ok(SchemaChannel::new(
            Arc::clone(&self.shared),
            index,
            Some(self.peer.clone()),
        ))
    }

    pub fn schemas(&self) -> &SchemaTable {
        &self.shared.ctx.table
    }

    /// Run `callback` once when the connection ends.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.peer.on_close(callback);
    }

    pub fn on_decode_error(&self, handler: impl Fn(&DecodeError) + Send + Sync + 'static) {
        self.shared.set_decode_error_handler(Arc::new(handler));
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shared.close();
        self.peer.close();
    }

    /// Close, then wait until queued messages were written.
    pub async fn shutdown(&self) {
        self.close();
        self.peer.closed().await;
    }

    /// `true` once closed locally or by the server.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.peer.is_closed()
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEndpoint")
            .field("identity", self.identity())
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use herald_schema::{Record, SchemaMap};
    use herald_transport::memory;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::EndpointConfig;
    use crate::endpoint::Endpoint;
    use crate::error::PeerError;
    use crate::pubsub::{LocalPubSub, PubSub};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    async fn client(
        schemas: SchemaMap,
        pubsub: Option<Arc<dyn PubSub>>,
    ) -> (ClientEndpoint, herald_transport::ServerHandle) {
        let (server, connector) = memory::server();
        let mut config = EndpointConfig::new(schemas)
            .with_remote(connector)
            .with_identity("me");
        if let Some(pubsub) = pubsub {
            config = config.with_pubsub(pubsub);
        }
        let endpoint = Endpoint::open(config)
            .await
            .expect("client should connect")
            .into_client()
            .expect("endpoint should be a client");
        (endpoint, server)
    }

    #[tokio::test]
    async fn send_writes_discriminator_then_payload() {
        let schemas = SchemaMap::new().with("ping", json!({ "n": "varuint" }));
        let (client, mut server) = client(schemas, None).await;
        let mut conn = server.accept().await.expect("server should see the client");
        assert_eq!(conn.info().query_param("clientId"), Some("me"));

        client
            .channel("ping")
            .unwrap()
            .send(&record(json!({ "n": 5 })))
            .expect("send should enqueue");

        let frame = conn.events().next().await.expect("frame should arrive");
        let descriptor = client.schemas().by_name("ping").unwrap();
        let payload = descriptor
            .encode("me", &record(json!({ "n": 5 })))
            .unwrap();
        assert_eq!(frame[0], 0x00);
        assert_eq!(&frame[1..], payload.as_ref());
    }

    #[tokio::test]
    async fn inbound_records_hide_sender() {
        let schemas = SchemaMap::new().with("chat", json!({ "text": "string" }));
        let (client, mut server) = client(schemas, None).await;
        let conn = server.accept().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.channel("chat").unwrap().on_message(move |msg| {
            tx.send((msg.sender().map(str::to_string), msg.record().clone()))
                .unwrap();
        });

        let frame = client
            .schemas()
            .by_name("chat")
            .unwrap()
            .encode_frame("server", &record(json!({ "text": "hello" })))
            .unwrap();
        conn.sink().send(frame).unwrap();

        let (sender, fields) = rx.recv().await.expect("handler should run");
        assert_eq!(sender, None);
        assert_eq!(fields, record(json!({ "text": "hello" })));
    }

    #[tokio::test]
    async fn broadcast_is_unsupported_without_pubsub() {
        let (client, _server) = client(SchemaMap::default(), None).await;
        let channel = client.channel("message").unwrap();
        let result = channel.broadcast(
            &record(json!({ "payload": "x", "meta": { "timestamp": 1 } })),
            None,
        );
        assert!(matches!(result, Err(PeerError::Unsupported(_))));
    }

    #[tokio::test]
    async fn broadcast_publishes_with_pubsub() {
        let bus = Arc::new(LocalPubSub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "herald.message",
            Arc::new(move |p: crate::pubsub::Publication| tx.send(p).unwrap()),
        )
        .unwrap();

        let (client, _server) =
            client(SchemaMap::default(), Some(bus.clone() as Arc<dyn PubSub>)).await;
        let delivered = client
            .channel("message")
            .unwrap()
            .broadcast(
                &record(json!({ "payload": "x", "meta": { "timestamp": 1 } })),
                Some(&PeerId::from("other")),
            )
            .unwrap();
        assert_eq!(delivered, 0);

        let publication = rx.recv().await.unwrap();
        assert_eq!(publication.origin, "me");
        assert_eq!(publication.exclude.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn on_close_fires_when_server_hangs_up() {
        let (client, mut server) = client(SchemaMap::default(), None).await;
        let conn = server.accept().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        client.on_close(move || {
            let _ = tx.send(());
        });
        conn.sink().close();

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("close should be observed")
            .unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.channel("message").unwrap().send(&record(
                json!({ "payload": "x", "meta": { "timestamp": 1 } })
            )),
            Err(PeerError::Closed)
        ));
    }

    #[tokio::test]
    async fn unknown_schema_name_fails() {
        let (client, _server) = client(SchemaMap::default(), None).await;
        assert!(matches!(
            client.channel("nope"),
            Err(PeerError::UnknownSchema(name)) if name == "nope"
        ));
    }
}
