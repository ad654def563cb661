//! dc-agent: device-side agent for device-connect
//!
//! The agent keeps one authenticated websocket to the management server and
//! multiplexes remote shells, port forwarding and update client commands
//! over it.

pub mod daemon;
pub mod pty;
pub mod session;
pub mod tunnel;

pub use daemon::Daemon;
pub use session::{FrameSender, HandlerError, Router};
pub use tunnel::{Transport, TransportError};
