//! Unix domain socket transport.
//!
//! Messages are framed with [`herald_frame::MessageCodec`]; every connection
//! starts with the [`crate::handshake`] exchange that carries its query.

use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use herald_frame::MessageCodec;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionInfo, Query};
use crate::driver;
use crate::error::{Result, TransportError};
use crate::handshake;
use crate::server::{Acceptor, ServerHandle};

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Bind a socket at `path` and start accepting connections.
///
/// A stale socket file at `path` is replaced; any other kind of file is left
/// alone and binding fails. The socket file is removed when the server shuts
/// down, unless something else has replaced it meanwhile.
pub fn bind(path: impl AsRef<Path>, config: TransportConfig) -> Result<ServerHandle> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
    let path = path.as_ref().to_path_buf();
    check_path_len(&path)?;
    remove_stale_socket(&path)?;

    let bind_err = |source| TransportError::Bind {
        addr: path.display().to_string(),
        source,
    };

    let listener = {
        let _guard = runtime.enter();
        UnixListener::bind(&path).map_err(bind_err)?
    };
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.socket_mode))
        .map_err(bind_err)?;
    let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;
    let guard = SocketFileGuard {
        path: path.clone(),
        identity: (created.dev(), created.ino()),
    };

    info!(?path, "listening on unix domain socket");

    let (acceptor, handle) = ServerHandle::channel(format!("unix://{}", path.display()));
    runtime.spawn(accept_loop(listener, acceptor, config, guard));
    Ok(handle)
}

/// Connect to a listening socket and perform the client handshake.
pub async fn connect(
    path: impl AsRef<Path>,
    query: &Query,
    config: &TransportConfig,
) -> Result<Connection> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::Connect {
            addr: path.display().to_string(),
            source,
        })?;
    let mut framed = Framed::new(stream, MessageCodec::with_config(config.frame.clone()));
    handshake::client(&mut framed, query, &config.handshake).await?;

    debug!(?path, "connected to unix domain socket");
    let info = ConnectionInfo::new(query.clone(), format!("unix://{}", path.display()));
    Ok(driver::spawn(framed, info, config.frame.max_payload_size))
}

async fn accept_loop(
    listener: UnixListener,
    acceptor: Acceptor,
    config: TransportConfig,
    _guard: SocketFileGuard,
) {
    let shutdown = acceptor.shutdown_token().clone();
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    warn!(error = %TransportError::Accept(err), "accept failed");
                    continue;
                }
            },
        };
        debug!("accepted connection");

        let acceptor = acceptor.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, MessageCodec::with_config(config.frame.clone()));
            match handshake::server(&mut framed, &config.handshake).await {
                Ok(query) => {
                    let info = ConnectionInfo::new(query, "unix");
                    let conn = driver::spawn(framed, info, config.frame.max_payload_size);
                    acceptor.deliver(conn).await;
                }
                Err(err) => warn!(error = %err, "handshake failed"),
            }
        });
    }
    debug!("unix accept loop stopped");
}

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    let bind_err = |source| TransportError::Bind {
        addr: path.display().to_string(),
        source,
    };
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(bind_err(err)),
    };
    if !metadata.file_type().is_socket() {
        return Err(bind_err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "existing path is not a unix socket",
        )));
    }
    debug!(?path, "removing stale socket");
    std::fs::remove_file(path).map_err(bind_err)
}

/// Removes the socket file on drop if it is still the one we created.
struct SocketFileGuard {
    path: PathBuf,
    identity: (u64, u64),
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.identity {
            debug!(path = ?self.path, "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
        }
    }
}
