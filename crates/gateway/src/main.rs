use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use sb_gateway::bootstrap;
use sb_gateway::cli::{self, Cli, Command, ConfigCommand};
use sb_gateway::telemetry;
use sb_mcp_client::McpConnector;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    };

    // A stdin read parks a blocking thread that never returns on its own.
    runtime.shutdown_timeout(Duration::from_secs(1));
    code
}

/// Dispatch the subcommand. `Ok(false)` exits non-zero without an error
/// message of its own.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config_path = cli.config_path();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let config = cli::load_config(&config_path)?;
            let tracer_provider = telemetry::init_tracing(&config.log, &config.observability);
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                config = %config_path.display(),
                backends = config.backends.len(),
                "switchboard starting"
            );

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    shutdown_signal().await;
                    shutdown.cancel();
                }
            });

            let result = bootstrap::run_gateway(&config, &config_path, Arc::new(McpConnector), shutdown).await;
            if let Err(e) = &result {
                tracing::error!(error = %format!("{e:#}"), "gateway stopped");
            }
            telemetry::shutdown_tracing(tracer_provider);
            result.map(|()| true)
        }
        Some(Command::Check) => {
            telemetry::init_cli_tracing();
            let config = cli::load_config(&config_path)?;
            cli::check::run(&config, &McpConnector).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = cli::load_config_unchecked(&config_path)?;
            Ok(cli::config::validate(&config, &config_path))
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli::load_config_unchecked(&config_path)?;
            cli::config::show(&config)?;
            Ok(true)
        }
        Some(Command::Config(ConfigCommand::Path)) => {
            println!("{}", config_path.display());
            Ok(true)
        }
        Some(Command::Version) => {
            println!(
                "switchboard {} (MCP {})",
                env!("CARGO_PKG_VERSION"),
                sb_mcp_client::protocol::PROTOCOL_VERSION,
            );
            Ok(true)
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }
}
