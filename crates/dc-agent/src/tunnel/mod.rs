//! Websocket tunnel to the management server

mod error;
mod reconnect;
mod transport;

pub use error::TransportError;
pub use reconnect::ExponentialBackoff;
pub use transport::{connect_url, user_agent, Transport, CONNECT_PATH};
