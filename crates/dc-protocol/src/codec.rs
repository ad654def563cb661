//! msgpack codec for protocol frames
//!
//! One frame maps to one websocket binary message, so no length prefix is
//! needed: the codec only turns a [`ProtoMsg`] into bytes and back. Structs
//! are encoded as maps keyed by field name, which is what the server side
//! expects.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::frame::ProtoMsg;

/// Encode a frame
pub fn encode(msg: &ProtoMsg) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(msg)?))
}

/// Decode a frame
pub fn decode(src: &[u8]) -> Result<ProtoMsg, ProtocolError> {
    Ok(rmp_serde::from_slice(src)?)
}

/// Encode a typed message body
pub fn encode_body<T: Serialize>(body: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(body)?))
}

/// Decode a typed message body
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Frame codec
///
/// Wrapper over [`decode`] that tracks how many bytes went through it, for
/// transport diagnostics.
#[derive(Debug, Default)]
pub struct FrameCodec {
    bytes_decoded: u64,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame
    pub fn decode(&mut self, src: &[u8]) -> Result<ProtoMsg, ProtocolError> {
        let msg = decode(src)?;
        self.bytes_decoded += src.len() as u64;
        tracing::trace!(
            proto = %msg.proto(),
            msg_type = msg.msg_type(),
            len = src.len(),
            "decoded frame"
        );
        Ok(msg)
    }

    /// Total bytes consumed by [`FrameCodec::decode`]
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }
}
