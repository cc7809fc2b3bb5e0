//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (admissions, depth, evictions, outcomes)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_enqueued_total` (counter): admitted requests
//! - `gateway_queue_depth` (gauge): requests waiting for the permit
//! - `gateway_evictions_total` (counter): waiting callers evicted on disconnect
//! - `gateway_terminal_total` (counter): finished requests by `reason`
//! - `gateway_discarded_events_total` (counter): events after finalization
//! - `gateway_generation_duration_seconds` (histogram): permit hold time
//! - `gateway_processing_permit_held` (gauge): 1 while a generation runs
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Reason labels come from a closed set of static strings

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

pub fn record_enqueued() {
    ::metrics::counter!("gateway_requests_enqueued_total").increment(1);
}

pub fn record_queue_depth(depth: usize) {
    ::metrics::gauge!("gateway_queue_depth").set(depth as f64);
}

pub fn record_evictions(count: usize) {
    ::metrics::counter!("gateway_evictions_total").increment(count as u64);
}

pub fn record_terminal(reason: &'static str) {
    ::metrics::counter!("gateway_terminal_total", "reason" => reason).increment(1);
}

pub fn record_discarded(count: u64) {
    ::metrics::counter!("gateway_discarded_events_total").increment(count);
}

pub fn record_generation_duration(elapsed: Duration) {
    ::metrics::histogram!("gateway_generation_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_permit_held(held: bool) {
    ::metrics::gauge!("gateway_processing_permit_held").set(if held { 1.0 } else { 0.0 });
}
