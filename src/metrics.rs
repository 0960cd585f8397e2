//! Metric helpers for `relayframe`.
//!
//! This module defines metric names and small helper functions wrapping
//! the [`metrics`](https://docs.rs/metrics) crate. Without the `metrics`
//! feature the helpers compile to nothing.

use std::time::Duration;

/// Name of the gauge tracking active backend connections.
pub const BACKENDS_ACTIVE: &str = "relayframe_backend_connections_active";
/// Name of the gauge tracking open client sessions.
pub const SESSIONS_ACTIVE: &str = "relayframe_sessions_active";
/// Name of the counter tracking frames moved through the proxy.
pub const FRAMES_PROCESSED: &str = "relayframe_frames_processed_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "relayframe_errors_total";
/// Name of the histogram tracking call latency in seconds.
pub const CALL_LATENCY: &str = "relayframe_call_latency_seconds";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Frames received from a peer.
    Inbound,
    /// Frames sent to a peer.
    Outbound,
}

impl Direction {
    /// Label value for this direction.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active backend connections gauge for `service`.
pub fn inc_backends(service: &str) {
    #[cfg(feature = "metrics")]
    metrics::gauge!(BACKENDS_ACTIVE, "service" => service.to_owned()).increment(1.0);
    #[cfg(not(feature = "metrics"))]
    let _ = service;
}

/// Decrement the active backend connections gauge for `service`.
pub fn dec_backends(service: &str) {
    #[cfg(feature = "metrics")]
    metrics::gauge!(BACKENDS_ACTIVE, "service" => service.to_owned()).decrement(1.0);
    #[cfg(not(feature = "metrics"))]
    let _ = service;
}

/// Increment the open sessions gauge.
pub fn inc_sessions() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// Decrement the open sessions gauge.
pub fn dec_sessions() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a processed frame for the given direction.
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    metrics::counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record an error occurrence of `kind`.
pub fn inc_errors(kind: &'static str) {
    #[cfg(feature = "metrics")]
    metrics::counter!(ERRORS_TOTAL, "kind" => kind).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Record how long a call to `service.method` took.
pub fn record_latency(service: &str, method: &str, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    metrics::histogram!(
        CALL_LATENCY,
        "service" => service.to_owned(),
        "method" => method.to_owned()
    )
    .record(elapsed.as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = (service, method, elapsed);
}

/// Serve Prometheus metrics on `addr`.
///
/// # Errors
///
/// Returns the exporter's build error, for example when a recorder is
/// already installed or the listener cannot bind.
#[cfg(feature = "metrics")]
pub fn install_exporter(
    addr: std::net::SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}
