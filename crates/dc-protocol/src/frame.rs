//! Frame model
//!
//! A frame is a [`ProtoHdr`] plus an opaque binary body. The header carries
//! the protocol discriminator used for routing, a message type string scoped
//! to that protocol, the session id and a small open map of scalar
//! properties (connection id, status code, terminal size, ...).

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::session::SessionId;

/// Header property map
pub type Properties = BTreeMap<String, PropertyValue>;

/// Protocol discriminator selecting the capability that owns a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Remote terminal
    Shell,
    /// File transfer
    FileTransfer,
    /// TCP/UDP port forwarding
    PortForward,
    /// Client command execution (check update, send inventory)
    MenderClient,
    /// Connection level control messages
    Control,
    /// Discriminator this agent does not know about
    Unknown(u16),
}

impl Protocol {
    /// Convert to the wire value
    pub fn as_u16(&self) -> u16 {
        match self {
            Protocol::Shell => 1,
            Protocol::FileTransfer => 2,
            Protocol::PortForward => 3,
            Protocol::MenderClient => 4,
            Protocol::Control => 0xFFFF,
            Protocol::Unknown(value) => *value,
        }
    }

    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Protocol::Shell,
            2 => Protocol::FileTransfer,
            3 => Protocol::PortForward,
            4 => Protocol::MenderClient,
            0xFFFF => Protocol::Control,
            other => Protocol::Unknown(other),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Shell => write!(f, "shell"),
            Protocol::FileTransfer => write!(f, "file-transfer"),
            Protocol::PortForward => write!(f, "port-forward"),
            Protocol::MenderClient => write!(f, "client-command"),
            Protocol::Control => write!(f, "control"),
            Protocol::Unknown(value) => write!(f, "unknown({})", value),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u16::deserialize(deserializer).map(Protocol::from_u16)
    }
}

/// Scalar header property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// String view, if this is a string property
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view, accepting any integer encoding that fits in an i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtoHdr {
    /// Protocol discriminator
    pub proto: Protocol,
    /// Message type, scoped to the protocol
    #[serde(rename = "typ")]
    pub msg_type: String,
    /// Session this frame belongs to
    #[serde(rename = "sid", default)]
    pub session_id: SessionId,
    /// Open property map
    #[serde(rename = "props", default, deserialize_with = "nullable")]
    pub properties: Properties,
}

/// A complete frame: header plus opaque body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtoMsg {
    #[serde(rename = "hdr")]
    pub header: ProtoHdr,
    #[serde(default, deserialize_with = "nullable")]
    pub body: Bytes,
}

impl ProtoMsg {
    /// Create a frame with an empty body and no properties
    pub fn new(
        proto: Protocol,
        msg_type: impl Into<String>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self {
            header: ProtoHdr {
                proto,
                msg_type: msg_type.into(),
                session_id: session_id.into(),
                properties: Properties::new(),
            },
            body: Bytes::new(),
        }
    }

    /// Start a reply on the same protocol and session
    pub fn reply(&self, msg_type: impl Into<String>) -> Self {
        Self::new(
            self.header.proto,
            msg_type,
            self.header.session_id.clone(),
        )
    }

    /// Set a header property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.header.properties.insert(key.into(), value.into());
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Protocol discriminator
    pub fn proto(&self) -> Protocol {
        self.header.proto
    }

    /// Message type
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Session id
    pub fn session_id(&self) -> &SessionId {
        &self.header.session_id
    }

    /// Look up a header property
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.header.properties.get(key)
    }

    /// Look up a string header property; empty strings count as absent
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.property(key)
            .and_then(PropertyValue::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Peers written in other languages encode empty maps and byte slices as nil.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
