//! dc-protocol: Wire protocol for device-connect session multiplexing
//!
//! This crate defines the frames exchanged between the device agent and the
//! management server over a single websocket. Every frame carries a header
//! (protocol discriminator, message type, session id, properties) and an
//! opaque body, encoded as msgpack.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod session;

pub use codec::{decode, encode, FrameCodec};
pub use error::ProtocolError;
pub use frame::{PropertyValue, Properties, ProtoHdr, ProtoMsg, Protocol};
pub use message::{ErrorBody, Status};
pub use session::SessionId;
