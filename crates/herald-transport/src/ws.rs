//! WebSocket transport.
//!
//! Each application message is one binary WebSocket message. The connection
//! query travels in the request URI.

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{Connection, ConnectionInfo, Query};
use crate::driver::{self, WireMessage};
use crate::error::{Result, TransportError};
use crate::server::{Acceptor, ServerHandle};

/// Largest message tungstenite accepts with its default configuration.
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

impl WireMessage for Message {
    fn from_payload(payload: Bytes) -> Self {
        Message::Binary(payload.to_vec())
    }

    fn into_payload(self) -> Option<Bytes> {
        match self {
            Message::Binary(data) => Some(Bytes::from(data)),
            Message::Text(text) => Some(Bytes::from(text.into_bytes())),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
        }
    }
}

/// Bind a TCP listener at `addr` (`host:port`) and start accepting
/// WebSocket connections on any path.
pub fn bind(addr: &str) -> Result<ServerHandle> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
    let bind_err = |source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    };

    let std_listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    std_listener.set_nonblocking(true).map_err(bind_err)?;
    let listener = {
        let _guard = runtime.enter();
        TcpListener::from_std(std_listener).map_err(bind_err)?
    };
    let local = listener.local_addr().map_err(bind_err)?;
    info!(%local, "websocket listener bound");

    let (acceptor, handle) = ServerHandle::channel(format!("ws://{local}"));
    runtime.spawn(accept_loop(listener, acceptor));
    Ok(handle)
}

/// Connect to a WebSocket server. The query is taken from `url`.
pub async fn connect(url: &Url) -> Result<Connection> {
    let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    debug!(%url, "connected to websocket server");
    let query = parse_query(url.query());
    let remote = url.origin().ascii_serialization();
    Ok(driver::spawn(stream, ConnectionInfo::new(query, remote), MAX_MESSAGE_SIZE))
}

async fn accept_loop(listener: TcpListener, acceptor: Acceptor) {
    let shutdown = acceptor.shutdown_token().clone();
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %TransportError::Accept(err), "accept failed");
                    continue;
                }
            },
        };
        debug!(%remote_addr, "incoming TCP connection");

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Some(conn) = upgrade(stream, remote_addr.to_string()).await {
                acceptor.deliver(conn).await;
            }
        });
    }
    debug!("websocket accept loop stopped");
}

async fn upgrade(stream: TcpStream, remote: String) -> Option<Connection> {
    let mut request_query = None;
    let callback = |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        request_query = Some(parse_query(req.uri().query()));
        Ok(response)
    };

    let upgraded = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    match upgraded {
        Ok(ws) => {
            info!(%remote, "websocket connection established");
            let info = ConnectionInfo::new(request_query.unwrap_or_default(), remote);
            Some(driver::spawn(ws, info, MAX_MESSAGE_SIZE))
        }
        Err(err) => {
            warn!(%remote, error = %err, "websocket handshake failed");
            None
        }
    }
}

fn parse_query(query: Option<&str>) -> Query {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_strings() {
        let query = parse_query(Some("clientId=a%20b&x=1"));
        assert_eq!(query.get("clientId").map(String::as_str), Some("a b"));
        assert_eq!(query.get("x").map(String::as_str), Some("1"));
        assert!(parse_query(None).is_empty());
    }

    #[tokio::test]
    async fn exchange_binary_messages_with_query() {
        let mut server = bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("{}/herald?clientId=c1", server.local_addr())).unwrap();

        let mut client = connect(&url).await.unwrap();
        let mut accepted = server.accept().await.unwrap();
        assert_eq!(accepted.info().query_param("clientId"), Some("c1"));
        assert_eq!(client.info().query_param("clientId"), Some("c1"));

        client.sink().send(Bytes::from_static(&[0, 1, 2])).unwrap();
        assert_eq!(accepted.events().next().await.unwrap().as_ref(), &[0, 1, 2]);
        accepted.sink().send(Bytes::from_static(&[9])).unwrap();
        assert_eq!(client.events().next().await.unwrap().as_ref(), &[9]);

        accepted.sink().close();
        assert!(client.events().next().await.is_none());
    }

    #[test]
    fn bind_without_runtime_fails() {
        assert!(matches!(bind("127.0.0.1:0"), Err(TransportError::NoRuntime)));
    }
}
