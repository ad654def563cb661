//! Transport error types

use thiserror::Error;

/// Errors produced by the websocket transport
///
/// Every variant except `Unauthorized` and `ConnectFailed` is terminal for
/// the transport that produced it. The type is `Clone` so the terminal cause
/// can be handed out repeatedly by [`Transport::err`](super::Transport::err).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Dial or upgrade handshake failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The server rejected the bearer token; refresh it before retrying
    #[error("Unauthorized: server rejected the token")]
    Unauthorized,

    /// Operation attempted after the transport terminated
    #[error("Transport closed")]
    Closed,

    /// Inbound message could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Outbound frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// No pong within the probe deadline
    #[error("Deadline exceeded waiting for pong message")]
    ProbeTimeout,

    /// The peer closed the connection
    #[error("Closed by peer: {0}")]
    RemoteClosed(String),

    /// Socket read or write failed
    #[error("Socket error: {0}")]
    Socket(String),
}
