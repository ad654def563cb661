//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the device agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Management server base URL (http, https, ws or wss)
    pub server_url: String,

    /// Bearer token, when handed over directly
    pub token: Option<String>,

    /// File holding the bearer token, kept fresh by the authentication daemon
    pub token_path: Option<PathBuf>,

    /// How often the token file is checked for changes
    #[serde(with = "duration_secs")]
    pub token_poll_interval: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Websocket transport settings
    pub transport: TransportConfig,

    /// Remote terminal settings
    pub shell: ShellConfig,

    /// Port forwarding settings
    pub port_forward: PortForwardConfig,

    /// Client command settings
    pub client_command: ClientCommandConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: None,
            token_path: None,
            token_poll_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            transport: TransportConfig::default(),
            shell: ShellConfig::default(),
            port_forward: PortForwardConfig::default(),
            client_command: ClientCommandConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Check the configuration for values the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.is_empty() {
            return Err(ConfigError::MissingField("server_url".to_string()));
        }
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|prefix| self.server_url.starts_with(prefix));
        if !scheme_ok {
            return Err(ConfigError::Invalid(format!(
                "server_url must start with http(s):// or ws(s)://, got '{}'",
                self.server_url
            )));
        }

        if self.token.is_none() && self.token_path.is_none() {
            return Err(ConfigError::MissingField(
                "token or token_path".to_string(),
            ));
        }

        if self.transport.pong_timeout >= self.transport.ping_interval {
            return Err(ConfigError::Invalid(
                "transport.pong_timeout must be shorter than transport.ping_interval".to_string(),
            ));
        }

        if self.port_forward.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "port_forward.buffer_size must be greater than zero".to_string(),
            ));
        }

        if !self.shell.disable && self.shell.command.is_empty() {
            return Err(ConfigError::MissingField("shell.command".to_string()));
        }

        let sessions = &self.shell.sessions;
        if sessions.expire_after().is_some() && sessions.expire_after_idle().is_some() {
            tracing::warn!(
                "Both shell.sessions.expire_after and expire_after_idle are set; \
                 a session stops at whichever comes first"
            );
        }

        Ok(())
    }
}

/// Websocket transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between liveness probes
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// How long to wait for the probe's pong
    #[serde(with = "duration_secs")]
    pub pong_timeout: Duration,

    /// Timeout for the dial and upgrade handshake
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30 * 60),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Remote terminal settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Disable the remote terminal
    pub disable: bool,

    /// Shell to spawn
    pub command: String,

    /// Arguments passed to the shell
    pub arguments: Vec<String>,

    /// Initial terminal width
    pub terminal_width: u16,

    /// Initial terminal height
    pub terminal_height: u16,

    /// Environment variables for the shell
    pub env: Vec<(String, String)>,

    /// Session lifetime limits
    pub sessions: ShellSessionsConfig,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            disable: false,
            command: "/bin/sh".to_string(),
            arguments: vec!["--login".to_string()],
            terminal_width: 80,
            terminal_height: 40,
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            sessions: ShellSessionsConfig::default(),
        }
    }
}

/// Limits on shell session lifetime and count
///
/// Expiry only applies when `stop_expired` is set; a zero duration disables
/// that limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSessionsConfig {
    /// Stop sessions once they expire
    pub stop_expired: bool,

    /// Lifetime of a session from its start
    #[serde(with = "duration_secs")]
    pub expire_after: Duration,

    /// Lifetime of a session since the last input from the peer
    #[serde(with = "duration_secs")]
    pub expire_after_idle: Duration,

    /// Concurrent sessions allowed per user, 0 for no limit
    pub max_per_user: u32,
}

impl Default for ShellSessionsConfig {
    fn default() -> Self {
        Self {
            stop_expired: false,
            expire_after: Duration::ZERO,
            expire_after_idle: Duration::ZERO,
            max_per_user: 0,
        }
    }
}

impl ShellSessionsConfig {
    /// Absolute session lifetime, if enforced
    pub fn expire_after(&self) -> Option<Duration> {
        Some(self.expire_after).filter(|d| self.stop_expired && !d.is_zero())
    }

    /// Idle session lifetime, if enforced
    pub fn expire_after_idle(&self) -> Option<Duration> {
        Some(self.expire_after_idle).filter(|d| self.stop_expired && !d.is_zero())
    }
}

/// Port forwarding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortForwardConfig {
    /// Disable port forwarding
    pub disable: bool,

    /// Close a forwarded connection after this long without traffic
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Largest chunk read from a local socket per `forward` message
    pub buffer_size: usize,

    /// Timeout for dialing the local target
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            disable: false,
            idle_timeout: Duration::from_secs(600),
            buffer_size: 4096,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Client command settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCommandConfig {
    /// Disable client commands
    pub disable: bool,

    /// Update client executable invoked for client commands
    pub executable: String,
}

impl Default for ClientCommandConfig {
    fn default() -> Self {
        Self {
            disable: false,
            executable: "mender".to_string(),
        }
    }
}
