use std::net::SocketAddr;

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservation mutations attempted. Labels: op, outcome.
pub const BOOKINGS_TOTAL: &str = "labslot_bookings_total";

/// Counter: requests rejected because the slot was already booked.
pub const CONFLICTS_TOTAL: &str = "labslot_conflicts_total";

/// Counter: instrument deletions blocked by existing reservations.
pub const REFERENTIAL_BLOCKS_TOTAL: &str = "labslot_referential_blocks_total";

// ── Synchronization ─────────────────────────────────────────────

/// Counter: backend snapshots applied to a client cache. Labels: collection.
pub const SNAPSHOTS_APPLIED_TOTAL: &str = "labslot_snapshots_applied_total";

/// Counter: deliveries discarded because the cache was already newer.
pub const SNAPSHOTS_STALE_TOTAL: &str = "labslot_snapshots_stale_total";

/// Gauge: live snapshot subscriptions across all sync hubs.
pub const SUBSCRIBERS_ACTIVE: &str = "labslot_subscribers_active";

// ── Storage ─────────────────────────────────────────────────────

/// Counter: operations refused because the backend was unreachable.
pub const STORAGE_FAILURES_TOTAL: &str = "labslot_storage_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
