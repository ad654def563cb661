//! dc-core: Core abstractions and configuration for device-connect
//!
//! This crate provides the configuration structures, shared error types and
//! the credential supplier contract used by the agent.

pub mod config;
pub mod credentials;
pub mod error;
pub mod types;

pub use credentials::{FileTokenSupplier, StaticTokenSupplier, TokenSupplier};
pub use error::{ConfigError, CredentialError};
pub use types::Authz;
