//! Metrics export for the roomcast server.
//!
//! Domain metrics are recorded by `roomcast-core`; this module adds HTTP
//! request metrics and exports everything in Prometheus format.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "roomcast_http_requests_total";
    pub const HTTP_REQUEST_SECONDS: &str = "roomcast_http_request_seconds";
}

/// Describe every metric.
pub fn init_metrics() {
    roomcast_core::metrics::describe();
    metrics::describe_counter!(names::HTTP_REQUESTS_TOTAL, "HTTP requests by route and status");
    metrics::describe_histogram!(names::HTTP_REQUEST_SECONDS, "HTTP request latency in seconds");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record one HTTP request. `route` is the matched route template, so ids in
/// paths do not create new series.
pub fn record_http_request(method: &str, route: &str, status: u16, elapsed: Duration) {
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(names::HTTP_REQUEST_SECONDS, "route" => route.to_string())
        .record(elapsed.as_secs_f64());
}
