//! Performance metrics collection for VCSelect
//!
//! This module provides functionality for collecting and exposing request metrics
//! in Prometheus format.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::time::Instant;

/// Initialize the metrics collection system
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    // Create a Prometheus exporter
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record the duration of a successfully served request
pub fn record_request(path: &'static str, started: Instant) {
    histogram!("vcselect.request.duration_seconds", "path" => path)
        .record(started.elapsed().as_secs_f64());
}

/// Record a response assembled while some storage nodes were missing
pub fn record_partial_response(path: &'static str) {
    counter!("vcselect.partial_responses_total", "path" => path).increment(1);
}

/// Record one broadcast of the rollup cache reset
pub fn record_cache_reset_call() {
    counter!("vcselect.reset_rollup_result_cache.calls_total").increment(1);
}

/// Record a peer that failed to reset its rollup cache
pub fn record_cache_reset_error() {
    counter!("vcselect.reset_rollup_result_cache.errors_total").increment(1);
}

/// Record rows emitted by a live tail poll
pub fn record_tail_rows(rows: u64) {
    counter!("vcselect.tail.rows_total").increment(rows);
}
