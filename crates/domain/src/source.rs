//! Where configuration snapshots come from.
//!
//! A [`ConfigSource`] either yields a fully valid [`Config`] or an error;
//! a config with any `Error`-severity finding is rejected as a whole so
//! callers never act on a partial backend list.

use std::path::{Path, PathBuf};

use crate::config::{BackendDescriptor, Config};
use crate::error::{Error, Result};

/// Environment variable overriding the config path.
pub const CONFIG_ENV: &str = "SWITCHBOARD_CONFIG";

/// Supplies configuration snapshots.
pub trait ConfigSource: Send + Sync {
    /// Load and validate the current configuration.
    fn load(&self) -> Result<Config>;

    /// Load just the backend list.
    fn load_backends(&self) -> Result<Vec<BackendDescriptor>> {
        self.load().map(|c| c.backends)
    }
}

/// A TOML file on disk.
#[derive(Debug, Clone)]
pub struct TomlFileSource {
    path: PathBuf,
}

impl TomlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for TomlFileSource {
    fn load(&self) -> Result<Config> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| Error::Read {
            path: self.path.clone(),
            source,
        })?;
        parse_config(&raw)
    }
}

/// Parse a TOML document and reject it if validation finds errors.
pub fn parse_config(raw: &str) -> Result<Config> {
    let config: Config = toml::from_str(raw)?;

    let errors = config.errors();
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::Config(joined));
    }

    Ok(config)
}

/// `<user config dir>/switchboard/config.toml`, falling back to
/// `./config.toml` when the platform has no config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("switchboard").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}
