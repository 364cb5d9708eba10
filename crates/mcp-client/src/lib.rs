//! `sb-mcp-client`: MCP (Model Context Protocol) client for switchboard.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types shared by the client and server roles.
//! - Transports to backend MCP servers: a stdio transport that spawns a
//!   child process, and a streamable HTTP transport.
//! - [`BackendSession`], one open, initialized connection to a backend.
//! - [`Connector`], which turns a [`BackendDescriptor`] into a session.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sb_mcp_client::{Connector, McpConnector};
//!
//! let session = McpConnector.connect(&descriptor).await?;
//! for tool in session.list_tools().await? {
//!     println!("{}-{}", descriptor.name, tool.name);
//! }
//! let result = session.call_tool("search", json!({"q": "rust"})).await?;
//! session.close().await;
//! ```
//!
//! [`BackendDescriptor`]: sb_domain::BackendDescriptor

pub mod connector;
pub mod http;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience.
pub use connector::{Connector, McpConnector};
pub use protocol::{JsonRpcError, McpToolDef, RequestId};
pub use session::{BackendSession, McpError, McpSession};
pub use transport::{McpTransport, TransportError};
