//! Gateway construction and the `serve` lifecycle, shared by the binary and
//! the integration tests.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use sb_domain::{BackendDescriptor, Config, TomlFileSource};
use sb_mcp_client::Connector;

use crate::catalog::Catalog;
use crate::registry::Registry;
use crate::server::{self, GatewayServer};
use crate::watcher::{ConfigReloader, ConfigWatcher};

/// The wired-up gateway: one registry and the server reading its catalog.
pub struct Gateway {
    pub registry: Arc<Registry>,
    pub server: Arc<GatewayServer>,
}

impl Gateway {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let catalog = Arc::new(Catalog::new());
        let registry = Arc::new(Registry::new(connector, catalog.clone()));
        let server = Arc::new(GatewayServer::new(catalog));
        Self { registry, server }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("none of the {configured} configured backend(s) could be connected")]
    NoBackends { configured: usize },
}

/// Connect the startup backend set.
///
/// Individual failures are logged and skipped. Returns how many backends
/// came up; zero is an error, and so is an empty list.
pub async fn connect_initial(registry: &Registry, backends: &[BackendDescriptor]) -> Result<usize, BootstrapError> {
    let report = registry.reconcile(backends.to_vec()).await;
    let connected = registry.len();

    if connected == 0 {
        return Err(BootstrapError::NoBackends {
            configured: backends.len(),
        });
    }
    if !report.failed.is_empty() {
        tracing::warn!(
            connected,
            failed = report.failed.len(),
            "starting with a partial backend set"
        );
    }
    tracing::info!(
        backends = connected,
        tools = registry.catalog().len(),
        "initial backends connected"
    );
    Ok(connected)
}

/// Log the non-fatal findings of a loaded config.
pub fn log_config_warnings(config: &Config) {
    for warning in config.warnings() {
        tracing::warn!(%warning, "config warning");
    }
}

/// Run the gateway until the client hangs up or `shutdown` fires.
///
/// Backend sessions are closed on every path out of here, including a
/// serve error.
pub async fn run_gateway(
    config: &Config,
    config_path: &Path,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    log_config_warnings(config);
    let gateway = Gateway::new(connector);

    let initial = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested while connecting backends");
            gateway.registry.shutdown().await;
            return Ok(());
        }
        result = connect_initial(&gateway.registry, &config.backends) => result,
    };
    if let Err(e) = initial {
        gateway.registry.shutdown().await;
        return Err(e.into());
    }

    let watcher = if config.watch.enabled {
        let reloader = Arc::new(ConfigReloader::new(
            Arc::new(TomlFileSource::new(config_path)),
            gateway.registry.clone(),
        ));
        match ConfigWatcher::spawn(config_path, config.watch.debounce(), reloader, shutdown.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, path = %config_path.display(), "config watching unavailable, hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    let served = server::serve(gateway.server.clone(), &config.server, shutdown.clone()).await;

    // Stop the watcher first so no reload races the final teardown.
    shutdown.cancel();
    if let Some(watcher) = watcher {
        watcher.join().await;
    }
    gateway.registry.shutdown().await;
    tracing::info!("shutdown complete");

    served.context("serving MCP")
}
