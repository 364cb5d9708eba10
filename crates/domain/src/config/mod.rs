mod backends;
mod observability;
mod server;

pub use backends::*;
pub use observability::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Backend MCP servers, in config-file order.
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Check the config for problems. An empty result means the config
    /// is usable as-is.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.transport == ServerTransport::Tcp
            && self.server.listen.parse::<std::net::SocketAddr>().is_err()
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.listen".into(),
                message: format!("'{}' is not a socket address", self.server.listen),
            });
        }

        if self.watch.debounce_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "watch.debounce_ms".into(),
                message: "debounce_ms must be greater than 0".into(),
            });
        }

        if self.backends.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "backends".into(),
                message: "no backends configured".into(),
            });
        }

        let mut seen = HashSet::new();
        for (i, backend) in self.backends.iter().enumerate() {
            if !is_valid_backend_name(&backend.name) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("backends[{i}].name"),
                    message: format!(
                        "'{}' must be non-empty and use only letters, digits, '_' or '.'",
                        backend.name
                    ),
                });
            } else if !seen.insert(backend.name.as_str()) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("backends[{i}].name"),
                    message: format!("duplicate backend name '{}'", backend.name),
                });
            }

            match backend.transport {
                TransportKind::Stdio if backend.command.trim().is_empty() => {
                    errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("backends[{i}].command"),
                        message: "stdio backend needs a command".into(),
                    });
                }
                TransportKind::Http
                    if backend.url.as_deref().map_or(true, |u| u.trim().is_empty()) =>
                {
                    errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("backends[{i}].url"),
                        message: "http backend needs a url".into(),
                    });
                }
                _ => {}
            }

            if backend.timeout_secs == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("backends[{i}].timeout_secs"),
                    message: "timeout_secs must be greater than 0".into(),
                });
            }
        }

        errors
    }

    /// Only the `Error`-severity findings.
    pub fn errors(&self) -> Vec<ConfigError> {
        self.with_severity(ConfigSeverity::Error)
    }

    /// Only the `Warning`-severity findings. Loading never fails on these,
    /// so callers log them once a subscriber is installed.
    pub fn warnings(&self) -> Vec<ConfigError> {
        self.with_severity(ConfigSeverity::Warning)
    }

    fn with_severity(&self, severity: ConfigSeverity) -> Vec<ConfigError> {
        self.validate()
            .into_iter()
            .filter(|e| e.severity == severity)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_only_warns() {
        let issues = Config::default().validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
        assert_eq!(issues[0].field, "backends");

        let config = Config::default();
        assert!(config.errors().is_empty());
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "backends");
    }

    #[test]
    fn duplicate_names_rejected() {
        let config = Config {
            backends: vec![
                BackendDescriptor::http("alpha", "http://a/mcp"),
                BackendDescriptor::http("alpha", "http://b/mcp"),
            ],
            ..Config::default()
        };
        let errors = config.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "backends[1].name");
    }

    #[test]
    fn missing_endpoint_fields_rejected() {
        let mut http = BackendDescriptor::http("web", "");
        http.url = None;
        let config = Config {
            backends: vec![BackendDescriptor::stdio("fs", " "), http],
            ..Config::default()
        };
        let fields: Vec<_> = config.errors().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["backends[0].command", "backends[1].url"]);
    }

    #[test]
    fn tcp_listen_must_parse() {
        let mut config = Config {
            backends: vec![BackendDescriptor::stdio("fs", "node")],
            ..Config::default()
        };
        config.server.transport = ServerTransport::Tcp;
        config.server.listen = "localhost".into();
        assert_eq!(config.errors()[0].field, "server.listen");

        config.server.listen = "127.0.0.1:9000".into();
        assert!(config.errors().is_empty());
    }

    #[test]
    fn display_includes_tag() {
        let e = ConfigError {
            severity: ConfigSeverity::Error,
            field: "backends[0].name".into(),
            message: "bad".into(),
        };
        assert_eq!(e.to_string(), "[ERROR] backends[0].name: bad");
    }
}
