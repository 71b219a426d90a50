use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Size of the schema discriminator that leads every frame.
pub const DISCRIMINATOR_SIZE: usize = 1;

/// One application message routed by schema index.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────────────────┐
/// │ Schema (1B)  │ Payload (codec-encoded)      │
/// └──────────────┴──────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Index of the schema whose codec decodes the payload.
    pub schema: u8,
    /// The codec-encoded record.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(schema: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            schema,
            payload: payload.into(),
        }
    }

    /// Split a received buffer into discriminator and payload.
    ///
    /// The payload shares the buffer's allocation.
    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(FrameError::Empty);
        }
        let schema = raw[0];
        let payload = raw.split_off(DISCRIMINATOR_SIZE);
        Ok(Self { schema, payload })
    }

    /// Encode the frame into a contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self.schema, &self.payload, &mut dst);
        dst.freeze()
    }

    /// The total wire size of this frame (discriminator + payload).
    pub fn wire_size(&self) -> usize {
        DISCRIMINATOR_SIZE + self.payload.len()
    }
}

/// Append `[schema][payload]` to `dst`.
pub fn encode_frame(schema: u8, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(DISCRIMINATOR_SIZE + payload.len());
    dst.put_u8(schema);
    dst.put_slice(payload);
}
