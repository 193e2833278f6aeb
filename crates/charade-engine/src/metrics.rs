//! Prometheus metrics for the mock engine.
//!
//! Tracks request throughput, response-file cache occupancy, and script
//! execution time.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_gauge, CounterVec, Encoder, Histogram,
    IntGauge, TextEncoder,
};

lazy_static! {
    /// Total number of requests served, by method and status
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "charade_requests_total",
        "Total number of requests served by the mock engine",
        &["method", "status"]
    )
    .unwrap();

    /// Number of entries held by the response-file cache
    pub static ref RESPONSE_FILE_CACHE_ENTRIES: IntGauge = register_int_gauge!(
        "charade_response_file_cache_entries",
        "The number of cached response files"
    )
    .unwrap();

    /// Script execution duration in seconds
    pub static ref SCRIPT_EXECUTION_DURATION: Histogram = register_histogram!(
        "charade_script_execution_duration_seconds",
        "Time spent executing response scripts",
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Helper to record a served request
pub fn record_request(method: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_includes_registered_metrics() {
        record_request("GET", 200);
        RESPONSE_FILE_CACHE_ENTRIES.set(3);

        let text = collect_metrics();
        assert!(text.contains("charade_requests_total"));
        assert!(text.contains("charade_response_file_cache_entries 3"));
    }
}
