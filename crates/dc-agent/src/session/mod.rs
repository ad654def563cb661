//! Session handlers multiplexed over the transport
//!
//! Inbound frames reach a [`Router`], which hands them to the handler
//! registered for the frame's protocol. Handlers write frames back through a
//! [`FrameSender`], which in production is the [`Transport`] itself.

mod client_command;
mod port_forward;
mod router;
mod shell;

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;

use dc_protocol::message::{port_forward::PROPERTY_CONNECTION_ID, MESSAGE_TYPE_ERROR};
use dc_protocol::{codec, ErrorBody, ProtoMsg, ProtocolError};

use crate::tunnel::{Transport, TransportError};

pub use client_command::{ClientCommandHandler, CommandRunner, ProcessRunner};
pub use port_forward::PortForwardHandler;
pub use router::{Handler, Router};
pub use shell::{Shell, ShellHandler};

/// Outbound half of the transport as seen by handlers
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Write one frame
    async fn send(&self, msg: ProtoMsg) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameSender for Transport {
    async fn send(&self, msg: ProtoMsg) -> Result<(), TransportError> {
        Transport::send(self, msg).await
    }
}

/// Session-local failures, reported to the peer as error frames
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("session limit reached for user '{0}'")]
    SessionLimit(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(u16),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("connection already exists: {0}")]
    DuplicateConnection(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid body: {0}")]
    Body(#[from] ProtocolError),
}

/// Build the `error` frame answering `msg`
///
/// The connection id of the failed message is echoed so the peer can match
/// the error to a forwarded connection.
pub fn error_frame(msg: &ProtoMsg, err: &HandlerError) -> ProtoMsg {
    let body = ErrorBody {
        error: err.to_string(),
        message_proto: Some(msg.proto().as_u16()),
        message_type: Some(msg.msg_type().to_string()),
    };

    let mut reply = msg.reply(MESSAGE_TYPE_ERROR);
    if let Some(id) = msg.property(PROPERTY_CONNECTION_ID) {
        reply = reply.with_property(PROPERTY_CONNECTION_ID, id.clone());
    }
    match codec::encode_body(&body) {
        Ok(encoded) => reply.with_body(encoded),
        Err(e) => {
            tracing::error!("Failed to encode error body: {}", e);
            reply
        }
    }
}

/// Send a frame, logging instead of failing
///
/// Handlers keep serving the session when a reply cannot be written; the
/// transport reports its own termination to the daemon.
pub(crate) async fn send_or_log(sender: &dyn FrameSender, msg: ProtoMsg) {
    let msg_type = msg.msg_type().to_string();
    if let Err(e) = sender.send(msg).await {
        tracing::warn!("Failed to send {} frame: {}", msg_type, e);
    }
}

/// Spawn a background task whose panic is logged rather than lost
pub(crate) fn spawn_guarded<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            tracing::error!("{} task panicked: {}", name, panic_message(panic.as_ref()));
        }
    })
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
