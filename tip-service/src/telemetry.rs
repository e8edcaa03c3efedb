//! Telemetry setup: structured logging and the optional metrics exporter.
//!
//! Call [`initialize`] once at startup. Logging goes through a
//! `tracing-subscriber` registry with an environment-based filter; when a
//! Prometheus bind address is configured, a scrape exporter is installed
//! as the global metrics recorder.

use std::net::SocketAddr;

use clap::Parser;
use eyre::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::metrics::describe_metrics;

/// Observability settings, read from the environment.
#[derive(Parser, Debug, Clone)]
pub struct TelemetryConfig {
    /// Bind address of the Prometheus scrape endpoint. Metrics are
    /// disabled when unset.
    #[clap(long = "metrics-bind-addr", env = "TIP_METRICS_BIND_ADDR")]
    pub metrics_bind_addr: Option<SocketAddr>,
}

/// Initializes tracing and metrics. Intended as a one-time setup call.
pub fn initialize(config: &TelemetryConfig) -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_line_number(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tip_service=debug,info".into()),
        )
        .init();

    if let Some(bind_addr) = config.metrics_bind_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(bind_addr)
            .install()
            .context("while installing the Prometheus metrics exporter")?;
    }
    describe_metrics();
    Ok(())
}
