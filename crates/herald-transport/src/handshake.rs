//! Connect handshake for stream transports.
//!
//! The client sends one JSON message naming the protocol, its version and
//! the connection query; the server answers with its own protocol and
//! version. Both messages travel inside ordinary stream frames before any
//! application traffic.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use herald_frame::FrameError;
use serde::{Deserialize, Serialize};

use crate::connection::Query;
use crate::error::{Result, TransportError};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_QUERY_PARAMS: usize = 64;

/// Client handshake request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: String,
    #[serde(default)]
    pub query: Query,
}

/// Server handshake response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol: String,
    pub version: String,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version (`<major>.<minor>`).
    pub protocol_version: String,
    /// Maximum handshake message size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "herald".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// Client side: send the query, wait for a compatible response.
pub async fn client<T>(io: &mut T, query: &Query, config: &HandshakeConfig) -> Result<()>
where
    T: Stream<Item = std::result::Result<Bytes, FrameError>>
        + Sink<Bytes, Error = FrameError>
        + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_query(query)?;

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        query: query.clone(),
    };

    tokio::time::timeout(config.timeout, async {
        io.send(Bytes::from(serde_json::to_vec(&req)?)).await?;
        let payload = recv_payload(io, config.max_handshake_payload).await?;
        let resp: HandshakeResponse = serde_json::from_slice(&payload)?;

        validate_protocol_name(&resp.protocol)?;
        validate_version(&resp.version)?;

        if resp.protocol != config.protocol_name {
            return Err(TransportError::HandshakeFailed(format!(
                "unknown protocol '{}' (expected '{}')",
                resp.protocol, config.protocol_name
            )));
        }
        if !is_version_compatible(&config.protocol_version, &resp.version)? {
            return Err(TransportError::HandshakeFailed(format!(
                "incompatible version '{}' (local '{}')",
                resp.version, config.protocol_version
            )));
        }
        Ok::<(), TransportError>(())
    })
    .await
    .map_err(|_| TransportError::Timeout(config.timeout))?
}

/// Server side: read and check the request, answer, return its query.
pub async fn server<T>(io: &mut T, config: &HandshakeConfig) -> Result<Query>
where
    T: Stream<Item = std::result::Result<Bytes, FrameError>>
        + Sink<Bytes, Error = FrameError>
        + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    tokio::time::timeout(config.timeout, async {
        let payload = recv_payload(io, config.max_handshake_payload).await?;
        let req: HandshakeRequest = serde_json::from_slice(&payload)?;

        validate_protocol_name(&req.protocol)?;
        validate_version(&req.version)?;
        validate_query(&req.query)?;

        if req.protocol != config.protocol_name {
            return Err(TransportError::HandshakeFailed(format!(
                "unknown protocol '{}' (expected '{}')",
                req.protocol, config.protocol_name
            )));
        }
        if !is_version_compatible(&req.version, &config.protocol_version)? {
            return Err(TransportError::HandshakeFailed(format!(
                "incompatible version '{}' (server '{}')",
                req.version, config.protocol_version
            )));
        }

        let resp = HandshakeResponse {
            protocol: config.protocol_name.clone(),
            version: config.protocol_version.clone(),
        };
        io.send(Bytes::from(serde_json::to_vec(&resp)?)).await?;
        Ok::<Query, TransportError>(req.query)
    })
    .await
    .map_err(|_| TransportError::Timeout(config.timeout))?
}

async fn recv_payload<T>(io: &mut T, max_handshake_payload: usize) -> Result<Bytes>
where
    T: Stream<Item = std::result::Result<Bytes, FrameError>> + Unpin,
{
    match io.next().await {
        Some(Ok(payload)) if payload.len() > max_handshake_payload => {
            Err(TransportError::HandshakeFailed(format!(
                "handshake payload too large: {} (max {})",
                payload.len(),
                max_handshake_payload
            )))
        }
        Some(Ok(payload)) => Ok(payload),
        Some(Err(err)) => Err(TransportError::Frame(err)),
        None => Err(TransportError::HandshakeFailed(
            "connection closed during handshake".to_string(),
        )),
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(TransportError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(TransportError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    parse_version(version).map(|_| ())
}

fn validate_query(query: &Query) -> Result<()> {
    if query.len() > MAX_QUERY_PARAMS {
        return Err(TransportError::HandshakeFailed(format!(
            "too many query parameters: {} (max {})",
            query.len(),
            MAX_QUERY_PARAMS
        )));
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |reason: &str| {
        TransportError::HandshakeFailed(format!("invalid version '{version}': {reason}"))
    };

    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use herald_frame::MessageCodec;
    use tokio_util::codec::Framed;

    use super::*;

    fn framed_pair() -> (
        Framed<tokio::io::DuplexStream, MessageCodec>,
        Framed<tokio::io::DuplexStream, MessageCodec>,
    ) {
        let (left, right) = tokio::io::duplex(4096);
        (
            Framed::new(left, MessageCodec::new()),
            Framed::new(right, MessageCodec::new()),
        )
    }

    #[tokio::test]
    async fn successful_handshake_carries_query() {
        let (mut client_io, mut server_io) = framed_pair();
        let query: Query = [("clientId".to_string(), "peer-1".to_string())].into();

        let server_task = tokio::spawn(async move {
            server(&mut server_io, &HandshakeConfig::default()).await.unwrap()
        });
        client(&mut client_io, &query, &HandshakeConfig::default())
            .await
            .unwrap();

        assert_eq!(server_task.await.unwrap(), query);
    }

    #[tokio::test]
    async fn rejects_protocol_mismatch() {
        let (mut client_io, mut server_io) = framed_pair();
        let client_config = HandshakeConfig {
            protocol_name: "other".to_string(),
            ..HandshakeConfig::default()
        };

        let server_task =
            tokio::spawn(async move { server(&mut server_io, &HandshakeConfig::default()).await });
        let _ = client(&mut client_io, &Query::new(), &client_config).await;

        assert!(matches!(
            server_task.await.unwrap(),
            Err(TransportError::HandshakeFailed(_))
        ));
    }

    #[tokio::test]
    async fn rejects_older_minor_version() {
        let (mut client_io, mut server_io) = framed_pair();
        let client_config = HandshakeConfig {
            protocol_version: "1.0".to_string(),
            ..HandshakeConfig::default()
        };
        let server_config = HandshakeConfig {
            protocol_version: "1.2".to_string(),
            ..HandshakeConfig::default()
        };

        let server_task = tokio::spawn(async move { server(&mut server_io, &server_config).await });
        let _ = client(&mut client_io, &Query::new(), &client_config).await;

        let err = server_task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("incompatible version"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_response() {
        let (mut client_io, _server_io) = framed_pair();
        let config = HandshakeConfig {
            timeout: Duration::from_millis(50),
            ..HandshakeConfig::default()
        };
        let err = client(&mut client_io, &Query::new(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("1.0").unwrap(), (1, 0));
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.x").is_err());
        assert!(parse_version("1.0.0").is_err());
        assert!(is_version_compatible("1.3", "1.2").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
    }
}
