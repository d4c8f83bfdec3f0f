use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking transitions attempted. Labels: transition, outcome.
pub const TRANSITIONS_TOTAL: &str = "shelf_transitions_total";

/// Histogram: transition latency in seconds, lock wait included. Labels: transition.
pub const TRANSITION_DURATION_SECONDS: &str = "shelf_transition_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: organizations with a loaded engine.
pub const ORGANIZATIONS_ACTIVE: &str = "shelf_organizations_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shelf_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shelf_wal_flush_batch_size";

/// Counter: overdue notifications emitted by the watcher.
pub const OVERDUE_NOTIFICATIONS_TOTAL: &str = "shelf_overdue_notifications_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
