//! Agent daemon
//!
//! Keeps one transport to the management server alive: fetch a token,
//! connect, route inbound frames until the connection ends or the token
//! changes, then tear every session down and reconnect with backoff.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use dc_core::config::AgentConfig;
use dc_core::{Authz, TokenSupplier};
use dc_protocol::Protocol;

use crate::session::{
    ClientCommandHandler, CommandRunner, FrameSender, Handler, PortForwardHandler,
    ProcessRunner, Router, ShellHandler,
};
use crate::tunnel::{ExponentialBackoff, Transport, TransportError};

/// Why a connection was given up
#[derive(Debug)]
enum Disconnect {
    /// Shutdown was requested
    Shutdown,
    /// A new token was published
    TokenChanged,
    /// The transport terminated; `None` if it was closed locally
    Lost(Option<TransportError>),
}

/// Reconnecting agent loop
pub struct Daemon {
    config: AgentConfig,
    supplier: Arc<dyn TokenSupplier>,
    runner: Arc<dyn CommandRunner>,
}

impl Daemon {
    /// Create a daemon that runs client commands as child processes
    pub fn new(config: AgentConfig, supplier: Arc<dyn TokenSupplier>) -> Self {
        Self {
            config,
            supplier,
            runner: Arc::new(ProcessRunner),
        }
    }

    /// Replace the command runner used for client commands
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Build a router with every capability enabled in the configuration
    pub fn build_router(&self) -> Router {
        let mut router = Router::new();

        if !self.config.shell.disable {
            let config = self.config.shell.clone();
            router.register(Protocol::Shell, move || {
                Handler::Shell(ShellHandler::new(config.clone()))
            });
        }

        if !self.config.port_forward.disable {
            let config = self.config.port_forward.clone();
            router.register(Protocol::PortForward, move || {
                Handler::PortForward(PortForwardHandler::new(config.clone()))
            });
        }

        if !self.config.client_command.disable {
            let config = self.config.client_command.clone();
            let runner = Arc::clone(&self.runner);
            router.register(Protocol::MenderClient, move || {
                Handler::ClientCommand(ClientCommandHandler::new(&config, Arc::clone(&runner)))
            });
        }

        router
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let mut token_rx = self.supplier.subscribe();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let authz = match self.supplier.fetch_token().await {
                Ok(authz) => authz,
                Err(e) => {
                    tracing::warn!("No token available: {}", e);
                    if !pause(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            token_rx.borrow_and_update();

            let transport = match Transport::connect(&authz, &self.config.transport).await {
                Ok(transport) => transport,
                Err(TransportError::Unauthorized) => {
                    tracing::warn!("Server rejected the token, fetching a new one");
                    if !pause(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!("Failed to connect to {}: {}", authz.server_url, e);
                    if !pause(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            backoff.reset();

            match self.serve(transport, &mut token_rx, &shutdown).await {
                Disconnect::Shutdown => break,
                Disconnect::TokenChanged => {
                    tracing::info!("Token changed, reconnecting");
                }
                Disconnect::Lost(err) => {
                    match err {
                        Some(e) => tracing::warn!("Disconnected: {}", e),
                        None => tracing::warn!("Disconnected"),
                    }
                    if !pause(&mut backoff, &shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Agent stopped");
        Ok(())
    }

    /// Route frames from one transport until it ends
    async fn serve(
        &self,
        transport: Transport,
        token_rx: &mut watch::Receiver<Option<Authz>>,
        shutdown: &CancellationToken,
    ) -> Disconnect {
        let transport = Arc::new(transport);
        let Some(mut frames) = transport.receive() else {
            return Disconnect::Lost(transport.err());
        };
        let sender: Arc<dyn FrameSender> = Arc::clone(&transport) as Arc<dyn FrameSender>;
        let mut router = self.build_router();
        let mut watching_token = true;

        tracing::info!("Connected, serving sessions");
        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Disconnect::Shutdown,
                changed = token_rx.changed(), if watching_token => {
                    if changed.is_err() {
                        tracing::debug!("Token supplier went away");
                        watching_token = false;
                    } else if token_rx.borrow_and_update().is_some() {
                        break Disconnect::TokenChanged;
                    }
                }
                frame = frames.recv() => match frame {
                    Some(msg) => router.dispatch(msg, Arc::clone(&sender)).await,
                    None => break Disconnect::Lost(transport.err()),
                },
            }
        };

        router.close_all().await;
        if let Err(e) = transport.close().await {
            tracing::debug!("Error closing transport: {}", e);
        }
        reason
    }
}

/// Sleep for the next backoff delay. Returns false if shutdown came first.
async fn pause(backoff: &mut ExponentialBackoff, shutdown: &CancellationToken) -> bool {
    let delay = backoff.next_delay();
    tracing::info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempts());
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.cancelled() => false,
    }
}
