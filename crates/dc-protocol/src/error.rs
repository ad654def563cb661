//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Frame could not be deserialized
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Frame body does not match the schema of its message type
    #[error("Invalid body for message type '{msg_type}': {reason}")]
    InvalidBody { msg_type: String, reason: String },
}
