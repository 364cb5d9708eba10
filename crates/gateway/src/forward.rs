//! Forwarding handlers: the bound `(session, local name)` behind every
//! exposed tool.

use std::sync::Arc;

use serde_json::Value;

use sb_mcp_client::{BackendSession, McpError};

/// Relays calls for one exposed tool to its backend.
///
/// Bound once at registration; calls never re-resolve the backend or parse
/// the qualified name. Arguments and results pass through untouched.
#[derive(Clone)]
pub struct ForwardingHandler {
    session: Arc<dyn BackendSession>,
    local_name: String,
}

impl ForwardingHandler {
    pub fn new(session: Arc<dyn BackendSession>, local_name: impl Into<String>) -> Self {
        Self {
            session,
            local_name: local_name.into(),
        }
    }

    pub fn backend(&self) -> &str {
        self.session.name()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Call the backend tool. No timeout is applied here; the session's
    /// transport owns that.
    pub async fn invoke(&self, arguments: Value) -> Result<Value, McpError> {
        self.session.call_tool(&self.local_name, arguments).await
    }
}

impl std::fmt::Debug for ForwardingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingHandler")
            .field("backend", &self.backend())
            .field("local_name", &self.local_name)
            .finish()
    }
}
