//! Protocol routing
//!
//! The router owns one handler per registered protocol. Handlers are built
//! lazily from their factory on the first frame for that protocol, so a
//! capability that is never used costs nothing.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;

use dc_protocol::{ProtoMsg, Protocol};

use super::{
    error_frame, panic_message, send_or_log, ClientCommandHandler, FrameSender, HandlerError,
    PortForwardHandler, ShellHandler,
};

/// A capability handler
pub enum Handler {
    Shell(ShellHandler),
    PortForward(PortForwardHandler),
    ClientCommand(ClientCommandHandler),
}

impl Handler {
    /// Handle one inbound frame
    pub async fn handle(&self, msg: ProtoMsg, sender: Arc<dyn FrameSender>) {
        match self {
            Handler::Shell(handler) => handler.handle(msg, sender).await,
            Handler::PortForward(handler) => handler.handle(msg, sender).await,
            Handler::ClientCommand(handler) => handler.handle(msg, sender).await,
        }
    }

    /// Release every session the handler holds
    pub async fn close(&self) {
        match self {
            Handler::Shell(handler) => handler.close().await,
            Handler::PortForward(handler) => handler.close().await,
            Handler::ClientCommand(handler) => handler.close(),
        }
    }
}

type Factory = Box<dyn Fn() -> Handler + Send + Sync>;

/// Dispatches inbound frames to per-protocol handlers
#[derive(Default)]
pub struct Router {
    factories: HashMap<Protocol, Factory>,
    handlers: HashMap<Protocol, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a protocol, replacing any earlier one
    ///
    /// A handler already built from the replaced factory is closed in the
    /// background.
    pub fn register<F>(&mut self, proto: Protocol, factory: F)
    where
        F: Fn() -> Handler + Send + Sync + 'static,
    {
        if self.factories.insert(proto, Box::new(factory)).is_some() {
            tracing::debug!("Replacing handler factory for {}", proto);
        }

        if let Some(stale) = self.handlers.remove(&proto) {
            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { stale.close().await });
                }
                Err(_) => tracing::warn!("No runtime to close replaced {} handler", proto),
            }
        }
    }

    /// Whether a factory is registered for the protocol
    pub fn is_registered(&self, proto: Protocol) -> bool {
        self.factories.contains_key(&proto)
    }

    /// Whether the handler for the protocol has been built
    pub fn is_active(&self, proto: Protocol) -> bool {
        self.handlers.contains_key(&proto)
    }

    /// Route one frame to its handler
    ///
    /// Frames for unregistered protocols are answered with an error frame.
    /// A panicking handler is logged and the router keeps serving.
    pub async fn dispatch(&mut self, msg: ProtoMsg, sender: Arc<dyn FrameSender>) {
        let proto = msg.proto();
        tracing::debug!(
            "Dispatching {} frame for {} session {}",
            msg.msg_type(),
            proto,
            msg.session_id()
        );

        if !self.handlers.contains_key(&proto) {
            let Some(factory) = self.factories.get(&proto) else {
                let err = HandlerError::UnknownProtocol(proto.as_u16());
                tracing::warn!("{}", err);
                send_or_log(sender.as_ref(), error_frame(&msg, &err)).await;
                return;
            };

            match std::panic::catch_unwind(AssertUnwindSafe(|| factory())) {
                Ok(handler) => {
                    tracing::info!("Starting {} handler", proto);
                    self.handlers.insert(proto, handler);
                }
                Err(panic) => {
                    tracing::error!(
                        "Building {} handler panicked: {}",
                        proto,
                        panic_message(panic.as_ref())
                    );
                    return;
                }
            }
        }

        let Some(handler) = self.handlers.get(&proto) else {
            return;
        };
        let msg_type = msg.msg_type().to_string();
        if let Err(panic) = AssertUnwindSafe(handler.handle(msg, sender))
            .catch_unwind()
            .await
        {
            tracing::error!(
                "{} handler panicked on {}: {}",
                proto,
                msg_type,
                panic_message(panic.as_ref())
            );
        }
    }

    /// Close every handler that has been built
    pub async fn close_all(&mut self) {
        for (proto, handler) in self.handlers.drain() {
            tracing::debug!("Closing {} handler", proto);
            handler.close().await;
        }
    }
}
