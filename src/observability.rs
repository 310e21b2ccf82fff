use std::net::SocketAddr;

use anyhow::Context;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

/// Histogram: slot generation latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "slotwise_slot_query_duration_seconds";

/// Histogram: slots returned per listing.
pub const SLOTS_RETURNED: &str = "slotwise_slots_returned";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: holds placed.
pub const HOLDS_PLACED_TOTAL: &str = "slotwise_holds_placed_total";

/// Counter: holds rejected because the interval was taken.
pub const HOLDS_REJECTED_TOTAL: &str = "slotwise_holds_rejected_total";

/// Counter: holds released by the consumer.
pub const HOLDS_RELEASED_TOTAL: &str = "slotwise_holds_released_total";

/// Counter: expired holds reaped by the janitor.
pub const HOLDS_EXPIRED_TOTAL: &str = "slotwise_holds_expired_total";

/// Counter: leftover holds removed by reconciliation.
pub const HOLDS_RECONCILED_TOTAL: &str = "slotwise_holds_reconciled_total";

/// Counter: bookings created from holds.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotwise_bookings_created_total";

/// Counter: confirmations refused. Labels: reason.
pub const CONFIRMS_REJECTED_TOTAL: &str = "slotwise_confirms_rejected_total";

/// Counter: booking status changes. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "slotwise_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus metrics exporter")?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTutor { .. } => "insert_tutor",
        Command::UpdateTutor { .. } => "update_tutor",
        Command::InsertRule { .. } => "insert_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::InsertException { .. } => "insert_exception",
        Command::DeleteException { .. } => "delete_exception",
        Command::InsertVacation { .. } => "insert_vacation",
        Command::DeleteVacation { .. } => "delete_vacation",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::Acknowledge { .. } => "acknowledge",
        Command::Cancel { .. } => "cancel",
        Command::Complete { .. } => "complete",
        Command::ReportNoShow { .. } => "report_no_show",
        Command::SelectTutors => "select_tutors",
        Command::SelectRules { .. } => "select_rules",
        Command::SelectExceptions { .. } => "select_exceptions",
        Command::SelectVacations { .. } => "select_vacations",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectSlots { .. } => "select_slots",
    }
}
