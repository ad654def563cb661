//! Update client commands

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use dc_core::config::ClientCommandConfig;
use dc_protocol::message::client_command::{CHECK_UPDATE, SEND_INVENTORY};
use dc_protocol::message::PROPERTY_STATUS;
use dc_protocol::{ProtoMsg, Status};

use super::{send_or_log, spawn_guarded, FrameSender};

/// Runs an external command to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv`; the error is the text reported to the peer
    async fn run(&self, argv: &[String]) -> Result<(), String>;
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> Result<(), String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "no command provided".to_string())?;

        tracing::debug!("Running {} {:?}", program, args);
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", program, e))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            Err(output.status.to_string())
        } else {
            Err(format!("{}: {}", output.status, stderr))
        }
    }
}

/// Handler for the update client protocol
///
/// `check-update` and `send-inventory` run the update client with the
/// matching subcommand in the background and reply with the same message
/// type carrying the outcome in the `status` property.
pub struct ClientCommandHandler {
    executable: String,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl ClientCommandHandler {
    pub fn new(config: &ClientCommandConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            executable: config.executable.clone(),
            runner,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle one inbound frame
    ///
    /// Returns as soon as the command is started; the reply is sent when it
    /// finishes.
    pub async fn handle(&self, msg: ProtoMsg, sender: Arc<dyn FrameSender>) {
        let command = match msg.msg_type() {
            command @ (CHECK_UPDATE | SEND_INVENTORY) => command.to_string(),
            _ => {
                let reply = outcome(&msg, Err("unknown message type".to_string()));
                send_or_log(sender.as_ref(), reply).await;
                return;
            }
        };

        let argv = vec![self.executable.clone(), command];
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.clone();
        spawn_guarded("client command", async move {
            tracing::info!("Running {}", argv.join(" "));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Abandoning {}: handler closed", argv.join(" "));
                    return;
                }
                result = runner.run(&argv) => result,
            };
            send_or_log(sender.as_ref(), outcome(&msg, result)).await;
        });
    }

    /// Abandon every running command
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

fn outcome(msg: &ProtoMsg, result: Result<(), String>) -> ProtoMsg {
    match result {
        Ok(()) => msg.reply(msg.msg_type()).with_property(PROPERTY_STATUS, Status::Normal),
        Err(e) => {
            tracing::warn!("Client command {} failed: {}", msg.msg_type(), e);
            msg.reply(msg.msg_type())
                .with_property(PROPERTY_STATUS, Status::Error)
                .with_body(Bytes::from(e))
        }
    }
}
