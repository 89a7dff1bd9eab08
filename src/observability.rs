use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: lessons booked.
pub const BOOKINGS_TOTAL: &str = "cadenza_bookings_total";

/// Counter: bookings rejected because the window was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "cadenza_slot_conflicts_total";

/// Counter: bookings rejected for package balance.
pub const INSUFFICIENT_HOURS_TOTAL: &str = "cadenza_insufficient_hours_total";

/// Counter: cancellations. Labels: refunded.
pub const CANCELLATIONS_TOTAL: &str = "cadenza_cancellations_total";

/// Counter: lessons completed.
pub const COMPLETIONS_TOTAL: &str = "cadenza_completions_total";

/// Counter: lessons marked no-show.
pub const NO_SHOWS_TOTAL: &str = "cadenza_no_shows_total";

/// Counter: meeting sessions opened.
pub const SESSIONS_OPENED_TOTAL: &str = "cadenza_sessions_opened_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: sessions found still open past lesson end + grace.
pub const STALE_SESSIONS_TOTAL: &str = "cadenza_stale_sessions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cadenza_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cadenza_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Install the default fmt tracing subscriber. Host calls this once at boot.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}
