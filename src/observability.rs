use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: availability answers served. Labels: source (live, fallback).
pub const AVAILABILITY_TOTAL: &str = "slotwise_availability_total";

/// Counter: booking attempts by result. Labels: outcome (created, manual, taken, failed).
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Counter: quota reservations. Labels: outcome (allowed, denied, error).
pub const QUOTA_RESERVATIONS_TOTAL: &str = "slotwise_quota_reservations_total";

/// Histogram: HTTP request latency in seconds. Labels: route, status.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "slotwise_http_request_duration_seconds";

// ── Upstream dependencies ───────────────────────────────────────

/// Histogram: calendar call latency in seconds. Labels: op.
pub const UPSTREAM_DURATION_SECONDS: &str = "slotwise_upstream_duration_seconds";

/// Counter: failed or timed-out calendar calls. Labels: op.
pub const UPSTREAM_FAILURES_TOTAL: &str = "slotwise_upstream_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
///
/// A failed install is logged and the service keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}
