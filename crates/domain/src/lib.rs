//! `sb-domain`: configuration and shared types for switchboard.
//!
//! Everything here is transport-agnostic: the MCP client and the gateway
//! both depend on this crate, never the other way round.

pub mod config;
pub mod error;
pub mod source;

pub use config::{BackendDescriptor, Config, Endpoint};
pub use error::{Error, Result};
pub use source::{default_config_path, ConfigSource, TomlFileSource};
