use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: admission attempts. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "slotkeeper_admissions_total";

/// Histogram: admission latency in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "slotkeeper_admission_duration_seconds";

/// Counter: lifecycle operations. Labels: op, outcome.
pub const TRANSITIONS_TOTAL: &str = "slotkeeper_transitions_total";

/// Counter: stale-version retries performed by `retry_on_stale`.
pub const STALE_RETRIES_TOTAL: &str = "slotkeeper_stale_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: resources (photographers) with at least one reservation loaded.
pub const RESOURCES_ACTIVE: &str = "slotkeeper_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const COMPACTIONS_TOTAL: &str = "slotkeeper_compactions_total";

/// Counter: event relay snapshots re-published after a subscriber lagged.
pub const RELAY_RESYNCS_TOTAL: &str = "slotkeeper_relay_resyncs_total";

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
