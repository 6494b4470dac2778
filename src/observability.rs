use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "trainingd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "trainingd_query_duration_seconds";

/// Counter: booking writes rejected because a participant was already booked.
pub const BOOKING_CONFLICTS_TOTAL: &str = "trainingd_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "trainingd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "trainingd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "trainingd_connections_rejected_total";

/// Counter: queries from a login that is not a registered user.
pub const AUTH_FAILURES_TOTAL: &str = "trainingd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "trainingd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "trainingd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "trainingd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| io::Error::other(format!("failed to install Prometheus metrics exporter: {e}")))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser(_) => "insert_user",
        Command::SelectUsers => "select_users",
        Command::SelectSessionTypes => "select_session_types",
        Command::InsertTrainingElement(_) => "insert_training_element",
        Command::SelectTrainingElements { .. } => "select_training_elements",
        Command::UpdateTrainingElement { .. } => "update_training_element",
        Command::DeleteTrainingElement { .. } => "delete_training_element",
        Command::InsertBooking(_) => "insert_booking",
        Command::SelectBookings(_) => "select_bookings",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}
