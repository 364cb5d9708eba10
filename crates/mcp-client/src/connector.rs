//! Turning a backend descriptor into an open session.

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::HttpTransport;
use crate::session::{BackendSession, McpError, McpSession};
use crate::transport::{McpTransport, StdioTransport};
use sb_domain::config::TransportKind;
use sb_domain::BackendDescriptor;

/// Opens sessions to backends.
///
/// The gateway only ever talks to backends through this trait, so tests can
/// substitute in-memory backends.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and initialize a session to `descriptor`'s endpoint.
    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Arc<dyn BackendSession>, McpError>;
}

/// The real connector: stdio child processes and streamable HTTP.
#[derive(Debug, Default, Clone, Copy)]
pub struct McpConnector;

#[async_trait]
impl Connector for McpConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Arc<dyn BackendSession>, McpError> {
        tracing::info!(
            backend = %descriptor.name,
            endpoint = %descriptor.endpoint(),
            transport = ?descriptor.transport,
            "connecting to backend"
        );

        let transport: Box<dyn McpTransport> = match descriptor.transport {
            TransportKind::Stdio => Box::new(StdioTransport::spawn(descriptor)?),
            TransportKind::Http => Box::new(HttpTransport::new(descriptor)?),
        };

        let session = McpSession::open(descriptor.name.clone(), transport).await?;
        Ok(Arc::new(session))
    }
}
