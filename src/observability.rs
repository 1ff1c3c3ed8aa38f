use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "kairos_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "kairos_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "kairos_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "kairos_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "kairos_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "kairos_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kairos_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kairos_wal_flush_batch_size";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: committed booking writes. Labels: op.
pub const BOOKINGS_WRITTEN_TOTAL: &str = "kairos_bookings_written_total";

/// Counter: rejected create/update/cancel requests. Labels: op, reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "kairos_booking_rejections_total";

/// Counter: availability checks allowed because the source failed or was empty. Labels: cause.
pub const AVAILABILITY_FAIL_OPEN_TOTAL: &str = "kairos_availability_fail_open_total";

/// Counter: processed side-effect jobs. Labels: kind, outcome.
pub const DISPATCH_JOBS_TOTAL: &str = "kairos_dispatch_jobs_total";

/// Counter: side-effect jobs dropped on a full or closed queue. Labels: kind.
pub const DISPATCH_DROPPED_TOTAL: &str = "kairos_dispatch_dropped_total";

/// Install the global tracing subscriber. `RUST_LOG` sets the filter (default `info`).
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

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
        Command::CreateBooking { .. } => "create_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectMyBookings { .. } => "select_my_bookings",
        Command::SelectAttendees { .. } => "select_attendees",
        Command::SelectDashboard => "select_dashboard",
        Command::SelectInvite { .. } => "select_invite",
        Command::SelectBookingStats => "select_booking_stats",
        Command::SelectUsers => "select_users",
        Command::SetRole { .. } => "set_role",
        Command::SelectAvailability => "select_availability",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::SelectOpenSlots { .. } => "select_open_slots",
        Command::SetProviderToken { .. } => "set_provider_token",
        Command::SignOut => "sign_out",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
