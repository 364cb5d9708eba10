use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server (the gateway's own MCP endpoint)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How MCP clients reach the gateway.
    #[serde(default)]
    pub transport: ServerTransport,
    /// Listen address when `transport = "tcp"`.
    #[serde(default = "d_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: ServerTransport::default(),
            listen: d_listen(),
        }
    }
}

/// Frontmost transport of the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    /// JSON-RPC over the process's stdin/stdout.
    #[default]
    Stdio,
    /// Newline-delimited JSON-RPC over a local TCP socket.
    Tcp,
}

fn d_listen() -> String {
    "127.0.0.1:7410".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hot reload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Reconcile backends when the config file changes.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Quiet period after the last change notification before reloading.
    #[serde(default = "d_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: d_debounce_ms(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }
}

fn d_true() -> bool {
    true
}

fn d_debounce_ms() -> u64 {
    1000
}
