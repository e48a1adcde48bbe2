use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "visitd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "visitd_query_duration_seconds";

/// Counter: booking requests. Labels: outcome (`created` or an error code).
pub const BOOKINGS_TOTAL: &str = "visitd_bookings_total";

/// Histogram: time to compute one day's free slots, in seconds.
pub const AVAILABILITY_DURATION_SECONDS: &str = "visitd_availability_duration_seconds";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: pending reservations moved to `expired`.
pub const SWEEP_EXPIRED_TOTAL: &str = "visitd_sweep_expired_total";

/// Counter: confirmed reservations moved to `completed`.
pub const SWEEP_COMPLETED_TOTAL: &str = "visitd_sweep_completed_total";

/// Counter: per-property sweep batches that failed to commit.
pub const SWEEP_FAILURES_TOTAL: &str = "visitd_sweep_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "visitd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "visitd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "visitd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "visitd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "visitd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "visitd_wal_flush_batch_size";

/// Counter: WAL enqueue attempts that timed out and were retried.
pub const WAL_ENQUEUE_RETRIES_TOTAL: &str = "visitd_wal_enqueue_retries_total";

#[derive(Debug)]
pub struct MetricsInitError(String);

impl std::fmt::Display for MetricsInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to install Prometheus metrics exporter: {}", self.0)
    }
}

impl std::error::Error for MetricsInitError {}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), MetricsInitError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsInitError(e.to_string()))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RequestBooking { .. } => "request_booking",
        Command::Reschedule { .. } => "reschedule",
        Command::Confirm { .. } => "confirm",
        Command::Cancel { .. } => "cancel",
        Command::Complete { .. } => "complete",
        Command::Amend { .. } => "amend",
        Command::RemoveReservation { .. } => "remove_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailableSlots { .. } => "select_available_slots",
        Command::SelectUpcoming { .. } => "select_upcoming",
        Command::SelectStatistics { .. } => "select_statistics",
        Command::AddBlackout { .. } => "add_blackout",
        Command::RemoveBlackout { .. } => "remove_blackout",
        Command::SelectBlackouts => "select_blackouts",
    }
}
