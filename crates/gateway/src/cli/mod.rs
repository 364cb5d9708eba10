pub mod check;
pub mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use sb_domain::source::CONFIG_ENV;
use sb_domain::{default_config_path, Config, ConfigSource, TomlFileSource};

/// switchboard: one MCP endpoint in front of many MCP servers.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version, about)]
pub struct Cli {
    /// Config file (default: <user config dir>/switchboard/config.toml).
    #[arg(long, short, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway (default when no subcommand is given).
    Serve,
    /// Connect to every configured backend once and list its tools.
    Check,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
    /// Print the config file path in use.
    Path,
}

// ── Config loading helpers ────────────────────────────────────────────

/// Load and validate the config at `path`. Any validation error fails the
/// whole load.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    TomlFileSource::new(path)
        .load()
        .with_context(|| format!("loading config {}", path.display()))
}

/// Parse the config at `path` without validating it, so `config validate`
/// can report every finding instead of the first failure.
pub fn load_config_unchecked(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
