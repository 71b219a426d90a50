use herald_frame::FrameConfig;

use crate::handshake::HandshakeConfig;

/// Transport-level settings shared by the socket transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Stream framing limits (Unix sockets).
    pub frame: FrameConfig,
    /// Connect handshake settings (Unix sockets).
    pub handshake: HandshakeConfig,
    /// Permission mode for created socket files.
    pub socket_mode: u32,
}

impl TransportConfig {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            handshake: HandshakeConfig::default(),
            socket_mode: Self::DEFAULT_SOCKET_MODE,
        }
    }
}
