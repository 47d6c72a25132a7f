//! Metrics collection and export for mudcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use mudcast_core::RouteReport;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "mudcast_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "mudcast_sessions_active";
    pub const FRAMES_TOTAL: &str = "mudcast_frames_total";
    pub const FRAMES_BYTES: &str = "mudcast_frames_bytes";
    pub const CHANNELS_ACTIVE: &str = "mudcast_channels_active";
    pub const CHANNEL_MESSAGES_TOTAL: &str = "mudcast_channel_messages_total";
    pub const DELIVERIES_TOTAL: &str = "mudcast_deliveries_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "mudcast_delivery_failures_total";
    pub const VETOES_TOTAL: &str = "mudcast_vetoes_total";
    pub const WATCH_NOTICES_TOTAL: &str = "mudcast_watch_notices_total";
    pub const LATENCY_SECONDS: &str = "mudcast_latency_seconds";
    pub const ERRORS_TOTAL: &str = "mudcast_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of logins since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of logged-in sessions");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channels");
    metrics::describe_counter!(
        names::CHANNEL_MESSAGES_TOTAL,
        "Channel messages routed"
    );
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Channel messages delivered to receivers");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Receiver hook failures, by stage"
    );
    metrics::describe_counter!(names::VETOES_TOTAL, "Channel messages vetoed by send hooks");
    metrics::describe_counter!(names::WATCH_NOTICES_TOTAL, "Watch notices sent");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record the outcome of one routed channel message.
pub fn record_route(channel: &str, report: &RouteReport) {
    let channel = channel.to_string();
    counter!(names::CHANNEL_MESSAGES_TOTAL, "channel" => channel.clone()).increment(1);
    if report.vetoed {
        counter!(names::VETOES_TOTAL, "channel" => channel).increment(1);
        return;
    }
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    counter!(names::DELIVERY_FAILURES_TOTAL, "stage" => "deliver").increment(report.failed as u64);
    counter!(names::DELIVERY_FAILURES_TOTAL, "stage" => "post").increment(report.post_failed as u64);
}

/// Record watch notices sent for one connection change.
pub fn record_watch_notices(count: usize) {
    counter!(names::WATCH_NOTICES_TOTAL).increment(count as u64);
}

/// Update the channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Counts a logged-in session while alive.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a login.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
