use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staygrid_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staygrid_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "staygrid_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "staygrid_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staygrid_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "staygrid_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staygrid_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staygrid_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: availability cache hits.
pub const CACHE_HITS_TOTAL: &str = "staygrid_cache_hits_total";

/// Counter: availability cache misses (including lookups on a closed cache).
pub const CACHE_MISSES_TOTAL: &str = "staygrid_cache_misses_total";

/// Counter: cache entries evicted for capacity.
pub const CACHE_EVICTIONS_TOTAL: &str = "staygrid_cache_evictions_total";

/// Counter: holds moved to expired by the sweep.
pub const HOLDS_EXPIRED_TOTAL: &str = "staygrid_holds_expired_total";

/// Counter: expiries skipped because a consume or release settled the hold
/// first. Labels: state.
pub const HOLD_EXPIRY_RACES_LOST_TOTAL: &str = "staygrid_hold_expiry_races_lost_total";

/// Counter: claims rejected by the write-time re-check. Labels: path.
pub const AVAILABILITY_CONFLICTS_TOTAL: &str = "staygrid_availability_conflicts_total";

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
        Command::UpsertUnit { .. } => "upsert_unit",
        Command::InsertOccupancy { .. } => "insert_occupancy",
        Command::ConsumeHold { .. } => "consume_hold",
        Command::TransitionOccupancy { .. } => "transition_occupancy",
        Command::CancelOccupancy { .. } => "cancel_occupancy",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::SelectUnits => "select_units",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBulkAvailability { .. } => "select_bulk_availability",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectAvailablePeriods { .. } => "select_available_periods",
        Command::SelectOccupancies { .. } => "select_occupancies",
        Command::SelectHolds { .. } => "select_holds",
    }
}
