use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::config::TransportConfig;
use crate::connection::{Connection, Query};
use crate::error::{Result, TransportError};
use crate::memory::MemoryConnector;
use crate::server::ServerHandle;

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `unix:///path/to.sock`
    Unix(PathBuf),
    /// `ws://host:port/path`
    WebSocket(Url),
}

impl Address {
    /// Parse an address URL; the scheme selects the transport.
    pub fn parse(addr: &str) -> Result<Self> {
        let url = Url::parse(addr).map_err(|e| TransportError::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "unix" => {
                if url.path().is_empty() {
                    return Err(TransportError::InvalidAddress {
                        addr: addr.to_string(),
                        reason: "missing socket path".to_string(),
                    });
                }
                Ok(Address::Unix(PathBuf::from(url.path())))
            }
            "ws" => Ok(Address::WebSocket(url)),
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
            Address::WebSocket(url) => write!(f, "{url}"),
        }
    }
}

/// Where a client endpoint connects to.
#[derive(Debug, Clone)]
pub enum Remote {
    /// Address URL (`unix://` or `ws://`).
    Url(String),
    /// In-process server.
    Memory(MemoryConnector),
}

impl Remote {
    /// Open a connection carrying `query` on the request.
    ///
    /// For URLs, query parameters already present in the URL are kept;
    /// `query` wins on conflicts.
    pub async fn connect(&self, query: &Query, config: &TransportConfig) -> Result<Connection> {
        match self {
            Remote::Memory(connector) => connector.connect(query.clone()).await,
            Remote::Url(addr) => match Address::parse(addr)? {
                #[cfg(unix)]
                Address::Unix(path) => crate::unix::connect(path, query, config).await,
                #[cfg(not(unix))]
                Address::Unix(_) => Err(TransportError::UnsupportedScheme("unix".to_string())),
                Address::WebSocket(url) => crate::ws::connect(&with_query(url, query)).await,
            },
        }
    }
}

impl From<MemoryConnector> for Remote {
    fn from(connector: MemoryConnector) -> Self {
        Remote::Memory(connector)
    }
}

impl From<&str> for Remote {
    fn from(url: &str) -> Self {
        Remote::Url(url.to_string())
    }
}

impl From<String> for Remote {
    fn from(url: String) -> Self {
        Remote::Url(url)
    }
}

/// Bind a server at an address URL.
pub fn bind(addr: &str, config: TransportConfig) -> Result<ServerHandle> {
    match Address::parse(addr)? {
        #[cfg(unix)]
        Address::Unix(path) => crate::unix::bind(path, config),
        #[cfg(not(unix))]
        Address::Unix(_) => {
            let _ = config;
            Err(TransportError::UnsupportedScheme("unix".to_string()))
        }
        Address::WebSocket(url) => {
            let host = url.host_str().ok_or_else(|| TransportError::InvalidAddress {
                addr: addr.to_string(),
                reason: "missing host".to_string(),
            })?;
            let port = url.port().unwrap_or(80);
            crate::ws::bind(&format!("{host}:{port}"))
        }
    }
}

fn with_query(mut url: Url, query: &Query) -> Url {
    let mut merged: Query = url.query_pairs().into_owned().collect();
    merged.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));
    url.set_query(None);
    if !merged.is_empty() {
        url.query_pairs_mut().extend_pairs(merged.iter());
    }
    url
}
