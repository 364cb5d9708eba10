//! Tracing setup. Everything goes to stderr because stdout may be the MCP
//! channel.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sb_domain::config::{LogConfig, LogFormat, ObservabilityConfig};

const DEFAULT_FILTER: &str = "info,sb_gateway=debug";

/// Install the subscriber used by `serve`.
///
/// When `otlp_endpoint` is configured, spans are also exported over
/// OTLP/gRPC. The returned provider must be shut down on exit (see
/// [`shutdown_tracing`]) to flush pending spans.
pub fn init_tracing(log: &LogConfig, obs: &ObservabilityConfig) -> Option<SdkTracerProvider> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (json, compact) = match log.format {
        LogFormat::Json => (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Compact => (
            None,
            Some(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr)),
        ),
    };

    let provider = obs.otlp_endpoint.as_deref().and_then(|endpoint| {
        let exporter = match opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
        {
            Ok(e) => e,
            Err(e) => {
                eprintln!("WARNING: failed to create OTLP exporter for {endpoint}: {e}; starting without OpenTelemetry");
                return None;
            }
        };

        let resource = opentelemetry_sdk::Resource::builder()
            .with_service_name(obs.service_name.clone())
            .build();

        Some(
            SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(obs.sample_rate))
                .with_resource(resource)
                .build(),
        )
    });

    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("switchboard")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(compact)
        .with(otel)
        .init();

    provider
}

/// Flush and stop the OTLP exporter, if one was started.
pub fn shutdown_tracing(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("WARNING: OpenTelemetry shutdown failed: {e}");
        }
    }
}

/// Compact stderr tracing for one-shot commands. Defaults to `warn` so
/// diagnostics do not drown the command's own output.
pub fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
