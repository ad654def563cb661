//! Message types for the device-connect protocol
//!
//! Message types are plain strings scoped to a [`Protocol`](crate::Protocol).
//! This module collects the closed set the agent understands, the property
//! keys they use, and the typed bodies carried by control messages.
//!
//! # Message Flow
//!
//! Port forwarding, for one connection id:
//!
//! 1. Server sends `new` with a [`PortForwardNew`] body; agent dials and
//!    echoes `new`
//! 2. Agent sends `forward` with bytes read locally, then waits for `ack`
//! 3. Server sends `forward`; agent writes it locally and answers `ack`
//! 4. Either side sends `stop`
//!
//! Failures are reported with an `error` message carrying an [`ErrorBody`].

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::ProtocolError;
use crate::frame::PropertyValue;

/// Generic error message type, shared by all protocols
pub const MESSAGE_TYPE_ERROR: &str = "error";

/// Property carrying a [`Status`] code
pub const PROPERTY_STATUS: &str = "status";

/// Port-forward message types and properties
pub mod port_forward {
    /// Open a new forwarded connection
    pub const NEW: &str = "new";
    /// Forwarded data
    pub const FORWARD: &str = "forward";
    /// Acknowledge a `forward` message
    pub const ACK: &str = "ack";
    /// Close a forwarded connection
    pub const STOP: &str = "stop";

    /// Property naming the forwarded connection
    pub const PROPERTY_CONNECTION_ID: &str = "connection_id";

    /// TCP transport
    pub const PROTOCOL_TCP: &str = "tcp";
    /// UDP transport
    pub const PROTOCOL_UDP: &str = "udp";
}

/// Remote shell message types and properties
pub mod shell {
    /// Spawn a shell for the session
    pub const SPAWN: &str = "new";
    /// Terminal data, both directions
    pub const COMMAND: &str = "shell";
    /// Resize the terminal
    pub const RESIZE: &str = "resize";
    /// Stop the shell
    pub const STOP: &str = "stop";
    /// Session keepalive request
    pub const PING: &str = "ping";
    /// Session keepalive reply
    pub const PONG: &str = "pong";

    pub const PROPERTY_TERMINAL_WIDTH: &str = "terminal_width";
    pub const PROPERTY_TERMINAL_HEIGHT: &str = "terminal_height";
    /// User that opened the session
    pub const PROPERTY_USER_ID: &str = "user_id";
}

/// Client command message types
pub mod client_command {
    /// Ask the update client to check for an update now
    pub const CHECK_UPDATE: &str = "check-update";
    /// Ask the update client to submit inventory now
    pub const SEND_INVENTORY: &str = "send-inventory";
}

/// Status carried in the `status` property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Status {
    /// Regular message
    Normal = 1,
    /// The message reports a failure
    Error = 2,
}

impl Status {
    /// Convert from the property value
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Normal),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

impl From<Status> for PropertyValue {
    fn from(status: Status) -> Self {
        PropertyValue::Int(status as i64)
    }
}

/// Body of a port-forward `new` message
///
/// All fields are optional on the wire so that a missing field can be
/// reported as an invalid message rather than a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardNew {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

impl PortForwardNew {
    /// Decode from a frame body
    pub fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        codec::decode_body(body)
    }
}

/// Body of an `error` message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable error
    #[serde(rename = "err")]
    pub error: String,
    /// Protocol of the message that failed
    #[serde(rename = "msgproto", default, skip_serializing_if = "Option::is_none")]
    pub message_proto: Option<u16>,
    /// Type of the message that failed
    #[serde(rename = "msgtype", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

impl ErrorBody {
    /// Create an error body for a failed message
    pub fn new(error: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message_proto: None,
            message_type: Some(message_type.into()),
        }
    }
}
