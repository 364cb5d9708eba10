//! `sb-gateway`: the aggregating MCP gateway.
//!
//! The [`registry::Registry`] owns the backend sessions and publishes their
//! namespaced tools into a [`catalog::Catalog`]; the [`server`] answers MCP
//! callers from that catalog; the [`watcher`] reconciles the registry when
//! the config file changes.

pub mod backend;
pub mod bootstrap;
pub mod catalog;
pub mod cli;
pub mod forward;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod watcher;

#[cfg(test)]
mod testing;
