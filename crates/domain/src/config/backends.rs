//! Backend descriptors: the `[[backends]]` entries of the config file.
//!
//! A descriptor is a `{name, endpoint}` pair. The name doubles as the
//! namespace prefix for every tool the backend exposes
//! (`{name}-{tool}`), so it must be unique within one config snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Separator between the backend name and the backend-local tool name.
pub const NAMESPACE_SEPARATOR: char = '-';

/// Configuration for a single backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Unique identifier for this backend (used in tool naming: `{name}-{tool}`).
    pub name: String,

    /// Transport type (`"stdio"` or `"http"`).
    #[serde(default)]
    pub transport: TransportKind,

    /// The command to spawn (stdio only, e.g. `"npx"`).
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the spawned process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Streamable HTTP endpoint (http only).
    #[serde(default)]
    pub url: Option<String>,

    /// Extra HTTP headers sent with every request (http only).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Per-request timeout enforced by the transport.
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
}

/// Transport kind for connecting to a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

/// Where a backend lives, independent of its name.
///
/// Two descriptors with the same name and an equal `Endpoint` are treated
/// as the same backend across a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Stdio { command, args, .. } if args.is_empty() => write!(f, "stdio:{command}"),
            Endpoint::Stdio { command, args, .. } => write!(f, "stdio:{command} {}", args.join(" ")),
            Endpoint::Http { url, .. } => write!(f, "{url}"),
        }
    }
}

impl BackendDescriptor {
    /// A stdio backend spawning `command` with no arguments.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            timeout_secs: d_timeout_secs(),
        }
    }

    /// A streamable HTTP backend at `url`.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: Some(url.into()),
            headers: BTreeMap::new(),
            timeout_secs: d_timeout_secs(),
        }
    }

    /// The endpoint part of the descriptor.
    pub fn endpoint(&self) -> Endpoint {
        match self.transport {
            TransportKind::Stdio => Endpoint::Stdio {
                command: self.command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            },
            TransportKind::Http => Endpoint::Http {
                url: self.url.clone().unwrap_or_default(),
                headers: self.headers.clone(),
            },
        }
    }

    /// True when `other` would connect to the same place the same way.
    pub fn same_endpoint(&self, other: &BackendDescriptor) -> bool {
        self.endpoint() == other.endpoint() && self.timeout_secs == other.timeout_secs
    }

    /// The gateway-visible name for one of this backend's tools.
    pub fn qualify(&self, local_name: &str) -> String {
        qualified_name(&self.name, local_name)
    }
}

/// `{backend}-{local}`.
pub fn qualified_name(backend: &str, local_name: &str) -> String {
    format!("{backend}{NAMESPACE_SEPARATOR}{local_name}")
}

/// Backend names are restricted to ASCII alphanumerics, `_` and `.` so the
/// first `-` of a qualified name always ends the prefix.
pub fn is_valid_backend_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn d_timeout_secs() -> u64 {
    30
}
