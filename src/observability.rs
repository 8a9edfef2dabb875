use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "servicesync_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "servicesync_query_duration_seconds";

/// Counter: committed lifecycle changes. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "servicesync_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "servicesync_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "servicesync_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "servicesync_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "servicesync_auth_failures_total";

/// Gauge: live bookings in the store.
pub const BOOKINGS_LIVE: &str = "servicesync_bookings_live";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "servicesync_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "servicesync_wal_flush_batch_size";

// ── Reconciler ──────────────────────────────────────────────────

/// Counter: stale pending bookings flagged with a timeout-check entry.
pub const STALE_MARKED_TOTAL: &str = "servicesync_stale_marked_total";

/// Counter: per-record failures inside a reconcile pass.
pub const RECONCILE_FAILURES_TOTAL: &str = "servicesync_reconcile_failures_total";

/// Histogram: reconcile pass duration in seconds.
pub const RECONCILE_TICK_DURATION_SECONDS: &str = "servicesync_reconcile_tick_duration_seconds";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertAssignment { .. } => "insert_assignment",
        Command::InsertTransition { .. } => "insert_transition",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectHistory { .. } => "select_history",
        Command::SelectProviders => "select_providers",
    }
}
