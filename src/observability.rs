use std::net::SocketAddr;

// ── Booking metrics ──────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_BOOKED_TOTAL: &str = "rezcore_reservations_booked_total";

/// Counter: booking requests refused. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "rezcore_booking_rejections_total";

/// Counter: bookings that lost the slot uniqueness claim.
pub const SLOT_CONFLICTS_TOTAL: &str = "rezcore_slot_conflicts_total";

/// Counter: reservations moved to CANCELLED.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "rezcore_reservations_cancelled_total";

/// Counter: reservations completed by the background sweep.
pub const RESERVATIONS_AUTO_COMPLETED_TOTAL: &str = "rezcore_reservations_auto_completed_total";

/// Histogram: availability resolution latency in seconds.
pub const AVAILABILITY_RESOLVE_SECONDS: &str = "rezcore_availability_resolve_seconds";

// ── Storage metrics ──────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rezcore_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rezcore_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "rezcore_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::warn!("metrics exporter not installed: {e}"),
    }
}
