//! Observability setup: structured logging, metrics (Prometheus), tracing.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize Prometheus metrics exporter on the given listen address.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record the outcome of one emergency reparent run.
pub fn record_reparent(keyspace: &str, shard: &str, outcome: &str) {
    metrics::counter!(
        "kestrel_reparent_total",
        "keyspace" => keyspace.to_string(),
        "shard" => shard.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the end-to-end duration of one emergency reparent run.
pub fn record_reparent_duration(keyspace: &str, shard: &str, seconds: f64) {
    metrics::histogram!(
        "kestrel_reparent_duration_seconds",
        "keyspace" => keyspace.to_string(),
        "shard" => shard.to_string()
    )
    .record(seconds);
}

/// Record how long one phase of the reparent state machine took.
pub fn record_reparent_phase_duration(phase: &str, seconds: f64) {
    metrics::histogram!(
        "kestrel_reparent_phase_duration_seconds",
        "phase" => phase.to_string()
    )
    .record(seconds);
}
