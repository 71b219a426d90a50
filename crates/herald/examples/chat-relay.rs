//! Chat relay over WebSockets: the server rebroadcasts every chat line to
//! all other connected clients.
//!
//! Run with:
//!   cargo run --example chat-relay
//!
//! Other clients can join while it runs:
//!   cargo run --features cli -- listen ws://127.0.0.1:PORT --schemas chat.json

use std::time::Duration;

use herald::transport::{self, TransportConfig};
use herald::{ClientEndpoint, Endpoint, EndpointConfig, Record, SchemaMap};
use serde_json::{json, Value};

fn schemas() -> SchemaMap {
    SchemaMap::new().with("chat", json!({ "text": "string" }))
}

fn line(text: &str) -> Record {
    let mut record = Record::new();
    record.insert("text".to_string(), Value::from(text));
    record
}

async fn join(url: &str, name: &str) -> Result<ClientEndpoint, Box<dyn std::error::Error>> {
    let client = Endpoint::open(
        EndpointConfig::new(schemas())
            .with_remote(url)
            .with_identity(name),
    )
    .await?
    .into_client()
    .ok_or("remote config should yield a client")?;

    let me = name.to_string();
    client.channel("chat")?.on_message(move |msg| {
        let text = msg.get("text").and_then(Value::as_str).unwrap_or_default();
        eprintln!("[{me}] heard: {text}");
    });
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let handle = transport::bind("ws://127.0.0.1:0", TransportConfig::default())?;
    let server = Endpoint::open(EndpointConfig::new(schemas()).with_server(handle))
        .await?
        .into_server()
        .ok_or("server config should yield a server")?;
    eprintln!("Listening on {}", server.local_addr());

    let chat = server.channel("chat")?;
    let relay = chat.clone();
    chat.on_message(move |msg| {
        let sender = msg.peer_id().clone();
        if let Err(err) = relay.broadcast(msg.record(), Some(&sender)) {
            eprintln!("relay failed: {err}");
        }
    });

    let alice = join(server.local_addr(), "alice").await?;
    let _bob = join(server.local_addr(), "bob").await?;
    let _carol = join(server.local_addr(), "carol").await?;
    while server.peer_count() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    alice.channel("chat")?.send(&line("hello from alice"))?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.shutdown().await;
    server.close();
    Ok(())
}
