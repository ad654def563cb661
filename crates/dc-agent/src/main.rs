//! device-connect agent daemon
//!
//! Runs on a managed device and keeps a websocket open to the management
//! server, serving remote shells, port forwarding and update client commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dc_agent::Daemon;
use dc_core::config::{self, AgentConfig};
use dc_core::{Authz, FileTokenSupplier, StaticTokenSupplier, TokenSupplier};

#[derive(Parser)]
#[command(name = "dc-agent")]
#[command(about = "device-connect agent - remote access to this device")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Management server URL
    /// Example: https://hosted.example.com
    #[arg(long, env = "DC_SERVER_URL")]
    server_url: Option<String>,

    /// Bearer token (prefer --token-file)
    #[arg(long, env = "DC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// File holding the bearer token, re-read when it changes
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("device-connect agent {} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config: AgentConfig = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::debug!("No config at {:?}, using defaults", config_path);
        AgentConfig::default()
    };

    // Apply command-line overrides
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }
    if let Some(token_file) = args.token_file {
        config.token_path = Some(token_file);
    }
    config.validate().context("Invalid configuration")?;

    let cancel = CancellationToken::new();
    let supplier = token_supplier(&config, &cancel)?;

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    tracing::info!("Connecting to {}", config.server_url);
    Daemon::new(config, supplier).run(cancel).await
}

/// Pick the token source: a watched file wins over an inline token
fn token_supplier(
    config: &AgentConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn TokenSupplier>> {
    if let Some(path) = &config.token_path {
        tracing::info!("Reading token from {:?}", path);
        let supplier = Arc::new(FileTokenSupplier::new(config.server_url.clone(), path.clone()));
        Arc::clone(&supplier).spawn_watcher(config.token_poll_interval, cancel.child_token());
        return Ok(supplier);
    }

    let token = config
        .token
        .clone()
        .context("No token configured (use --token-file or --token)")?;
    Ok(Arc::new(StaticTokenSupplier::new(Authz::new(
        config.server_url.clone(),
        token,
    ))))
}
