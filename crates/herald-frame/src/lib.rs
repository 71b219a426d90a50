//! Wire frames for herald.
//!
//! Two layers live here:
//! - [`Frame`]: one application message, a 1-byte schema discriminator
//!   followed by the codec-encoded payload.
//! - [`MessageCodec`]: length-prefixed framing used by byte-stream
//!   transports (Unix sockets) to turn a stream back into discrete messages.
//!   Message-oriented transports (WebSocket, in-memory) do not need it.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{
    decode_message, encode_message, FrameConfig, MessageCodec, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
    MAGIC,
};
pub use error::{FrameError, Result};
pub use frame::{encode_frame, Frame, DISCRIMINATOR_SIZE};
