//! Core domain types

use std::fmt;

/// Authorization material for one connection attempt
#[derive(Clone, PartialEq, Eq)]
pub struct Authz {
    /// Base URL of the management server (http, https, ws or wss)
    pub server_url: String,
    /// Bearer token presented on the upgrade request
    pub token: String,
}

impl Authz {
    /// Create new authorization material
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
        }
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Authz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authz")
            .field("server_url", &self.server_url)
            .field("token", &"<redacted>")
            .finish()
    }
}
