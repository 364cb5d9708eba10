//! Backend sessions: one open, initialized MCP connection per backend.

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::{self, InitializeResult, JsonRpcError, McpToolDef, ToolsListResult};
use crate::transport::{McpTransport, TransportError};

/// Upper bound on `tools/list` pages, against a backend that keeps
/// handing out cursors.
const MAX_LIST_PAGES: usize = 100;

/// An open connection to one backend MCP server.
///
/// Lifecycle is `open → closed`: once [`close`](Self::close) has run, every
/// further call fails.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Backend name this session was opened for.
    fn name(&self) -> &str;

    /// Enumerate every tool the backend exposes.
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError>;

    /// Invoke `local_name` with `arguments` and return the backend's raw result.
    async fn call_tool(&self, local_name: &str, arguments: Value) -> Result<Value, McpError>;

    /// Whether the underlying transport still looks usable.
    fn is_alive(&self) -> bool;

    /// Close the underlying connection.
    async fn close(&self);
}

/// [`BackendSession`] over an [`McpTransport`].
pub struct McpSession {
    name: String,
    transport: Box<dyn McpTransport>,
}

impl McpSession {
    /// Perform the MCP handshake (`initialize` + `notifications/initialized`)
    /// over `transport`. On failure the transport is shut down before the
    /// error is returned.
    pub async fn open(name: impl Into<String>, transport: Box<dyn McpTransport>) -> Result<Self, McpError> {
        let name = name.into();
        match handshake(&name, transport.as_ref()).await {
            Ok(()) => Ok(Self { name, transport }),
            Err(e) => {
                transport.shutdown().await;
                Err(e)
            }
        }
    }
}

async fn handshake(name: &str, transport: &dyn McpTransport) -> Result<(), McpError> {
    let params = serde_json::to_value(protocol::initialize_params())
        .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

    let result = transport
        .send_request("initialize", Some(params))
        .await?
        .into_result()
        .map_err(McpError::Rpc)?;

    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::Protocol(format!("failed to parse initialize result: {e}")))?;

    if init.protocol_version != protocol::PROTOCOL_VERSION {
        tracing::debug!(
            backend = %name,
            offered = protocol::PROTOCOL_VERSION,
            accepted = %init.protocol_version,
            "backend negotiated a different protocol version"
        );
    }

    transport.send_notification("notifications/initialized").await?;

    tracing::info!(
        backend = %name,
        server = %init.server_info.name,
        version = %init.server_info.version,
        "MCP handshake complete"
    );

    Ok(())
}

#[async_trait]
impl BackendSession for McpSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self
                .transport
                .send_request("tools/list", params)
                .await?
                .into_result()
                .map_err(McpError::Rpc)?;

            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| McpError::Protocol(format!("failed to parse tools/list result: {e}")))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        Err(McpError::Protocol(format!(
            "tools/list did not finish within {MAX_LIST_PAGES} pages"
        )))
    }

    async fn call_tool(&self, local_name: &str, arguments: Value) -> Result<Value, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::SessionClosed(self.name.clone()));
        }

        let params = serde_json::json!({
            "name": local_name,
            "arguments": arguments
        });

        self.transport
            .send_request("tools/call", Some(params))
            .await?
            .into_result()
            .map_err(McpError::Rpc)
    }

    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    async fn close(&self) {
        tracing::info!(backend = %self.name, "closing backend session");
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("backend returned {0}")]
    Rpc(JsonRpcError),

    #[error("backend session is closed: {0}")]
    SessionClosed(String),
}
