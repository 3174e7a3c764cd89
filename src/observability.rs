use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Domain outcomes ─────────────────────────────────────────────

/// Counter: booking requests by outcome (confirmed, waitlisted, conflict).
pub const BOOKINGS_TOTAL: &str = "slotline_bookings_total";

/// Counter: cancellations by outcome (cancelled, cancelled_and_promoted, already_cancelled).
pub const CANCELLATIONS_TOTAL: &str = "slotline_cancellations_total";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotline_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotline_connections_rejected_total";

/// Gauge: open notify hub channels (one per watched provider or inbox).
pub const NOTIFY_CHANNELS: &str = "slotline_notify_channels";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotline_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertService { .. } => "insert_service",
        Command::SelectServices { .. } => "select_services",
        Command::RequestBooking { .. } => "request_booking",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::ClearCancelled { .. } => "clear_cancelled",
        Command::ClearCustomerCancelled { .. } => "clear_customer_cancelled",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectServiceAvailability { .. } => "select_service_availability",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectWaitingList { .. } => "select_waiting_list",
        Command::RemoveWaitingEntry { .. } => "remove_waiting_entry",
        Command::PurgeWaitingList { .. } => "purge_waiting_list",
        Command::InsertNotification { .. } => "insert_notification",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::SelectUnreadCount { .. } => "select_unread_count",
        Command::MarkRead { .. } => "mark_read",
        Command::MarkAllRead { .. } => "mark_all_read",
        Command::ClearReadNotifications { .. } => "clear_read_notifications",
    }
}
