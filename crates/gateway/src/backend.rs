//! Connecting one backend: open a session, enumerate its tools, and wrap
//! each in a namespaced [`CapabilityDescriptor`].

use std::sync::Arc;

use serde_json::Value;

use sb_domain::BackendDescriptor;
use sb_mcp_client::protocol::McpToolDef;
use sb_mcp_client::{BackendSession, Connector, McpError};

use crate::forward::ForwardingHandler;

/// One tool as the gateway exposes it.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    /// `{backend}-{local_name}`; what gateway callers see.
    pub qualified_name: String,
    /// The name the backend knows the tool by.
    pub local_name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: Option<Value>,
    pub handler: ForwardingHandler,
}

impl CapabilityDescriptor {
    pub fn new(descriptor: &BackendDescriptor, session: &Arc<dyn BackendSession>, tool: McpToolDef) -> Self {
        Self {
            qualified_name: descriptor.qualify(&tool.name),
            handler: ForwardingHandler::new(session.clone(), tool.name.clone()),
            local_name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
            annotations: tool.annotations,
        }
    }

    /// Owning backend.
    pub fn backend(&self) -> &str {
        self.handler.backend()
    }

    /// The tool definition advertised by the gateway.
    pub fn to_tool_def(&self) -> McpToolDef {
        McpToolDef {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

/// A freshly opened backend with all of its capabilities.
pub struct ConnectedBackend {
    pub session: Arc<dyn BackendSession>,
    pub capabilities: Vec<CapabilityDescriptor>,
}

/// Open a session to `descriptor` and enumerate its tools.
///
/// All or nothing: if enumeration fails the session is closed here and only
/// the error comes back.
pub async fn connect_backend(
    connector: &dyn Connector,
    descriptor: &BackendDescriptor,
) -> Result<ConnectedBackend, McpError> {
    let session = connector.connect(descriptor).await?;

    match describe_backend(descriptor, &session).await {
        Ok(capabilities) => Ok(ConnectedBackend {
            session,
            capabilities,
        }),
        Err(e) => {
            session.close().await;
            Err(e)
        }
    }
}

/// Enumerate the tools of an open session as namespaced capabilities.
/// The caller owns the session and closes it on failure.
pub async fn describe_backend(
    descriptor: &BackendDescriptor,
    session: &Arc<dyn BackendSession>,
) -> Result<Vec<CapabilityDescriptor>, McpError> {
    let tools = session.list_tools().await.map_err(|e| {
        tracing::warn!(
            backend = %descriptor.name,
            error = %e,
            "tool enumeration failed"
        );
        e
    })?;

    Ok(tools
        .into_iter()
        .map(|tool| CapabilityDescriptor::new(descriptor, session, tool))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor, FakeConnector};

    #[tokio::test]
    async fn capabilities_are_namespaced() {
        let connector = FakeConnector::new().with_backend("alpha", &["search", "fetch"]);
        let connected = connect_backend(&connector, &descriptor("alpha")).await.unwrap();

        let names: Vec<_> = connected
            .capabilities
            .iter()
            .map(|c| (c.qualified_name.as_str(), c.local_name.as_str()))
            .collect();
        assert_eq!(names, vec![("alpha-search", "search"), ("alpha-fetch", "fetch")]);
        assert!(connected.capabilities.iter().all(|c| c.backend() == "alpha"));
    }

    #[tokio::test]
    async fn enumeration_failure_closes_session() {
        let connector = FakeConnector::new().failing_list("beta");
        let result = connect_backend(&connector, &descriptor("beta")).await;

        assert!(result.is_err());
        let opened = connector.opened_named("beta");
        assert_eq!(opened.len(), 1);
        assert!(opened[0].is_closed());
    }

    #[tokio::test]
    async fn connect_failure_opens_nothing() {
        let connector = FakeConnector::new().failing_connect("gamma");
        assert!(connect_backend(&connector, &descriptor("gamma")).await.is_err());
        assert!(connector.opened().is_empty());
    }

    #[tokio::test]
    async fn tool_def_uses_qualified_name() {
        let connector = FakeConnector::new().with_backend("alpha", &["search"]);
        let connected = connect_backend(&connector, &descriptor("alpha")).await.unwrap();
        let def = connected.capabilities[0].to_tool_def();
        assert_eq!(def.name, "alpha-search");
        assert_eq!(def.description, "search tool");
    }
}
