//! Prometheus metrics for the cache
//!
//! Operation counts and latencies by collection kind, expiry sweep volume and
//! registry size. Exposed in text format by the server's `/metrics` route.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Operation Counters ===

    /// Collection operations by kind, operation and outcome
    pub static ref OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "rollcache_operations_total",
        "Total collection operations",
        &["kind", "operation", "status"]
    ).unwrap();

    /// Metadata entries created by stores
    pub static ref ENTRIES_CREATED_TOTAL: CounterVec = register_counter_vec!(
        "rollcache_entries_created_total",
        "Metadata entries created by first stores",
        &["kind"]
    ).unwrap();

    /// Entries removed by fetch and delete
    pub static ref ENTRIES_REMOVED_TOTAL: CounterVec = register_counter_vec!(
        "rollcache_entries_removed_total",
        "Metadata entries removed with their values",
        &["kind", "operation"]
    ).unwrap();

    // === Latency Histograms ===

    /// Operation latency
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "rollcache_operation_duration_seconds",
        "Collection operation latency in seconds",
        &["kind", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    // === Errors ===

    /// Errors by type and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "rollcache_errors_total",
        "Total errors by type and operation",
        &["error_type", "operation"]
    ).unwrap();

    // === Registry ===

    /// Live collections
    pub static ref COLLECTIONS: Gauge = register_gauge!(
        "rollcache_collections",
        "Number of registered collections"
    ).unwrap();

    /// Health status (0=unhealthy, 1=healthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "rollcache_health_status",
        "Server health status (0=unhealthy, 1=healthy)"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    HEALTH_STATUS.set(1.0);
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record one collection operation
#[inline]
pub fn record_operation(kind: &str, operation: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    OPERATIONS_TOTAL
        .with_label_values(&[kind, operation, status])
        .inc();

    OPERATION_DURATION
        .with_label_values(&[kind, operation])
        .observe(duration_secs);
}

/// Record a newly created metadata entry
#[inline]
pub fn record_entry_created(kind: &str) {
    ENTRIES_CREATED_TOTAL.with_label_values(&[kind]).inc();
}

/// Record entries removed by a fetch or delete
#[inline]
pub fn record_entries_removed(kind: &str, operation: &str, count: usize) {
    if count > 0 {
        ENTRIES_REMOVED_TOTAL
            .with_label_values(&[kind, operation])
            .inc_by(count as f64);
    }
}

/// Record an error
#[inline]
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type, operation]).inc();
}

/// Update the registered collection count
#[inline]
pub fn update_collections(count: usize) {
    COLLECTIONS.set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init();
        assert_eq!(HEALTH_STATUS.get(), 1.0);
    }

    #[test]
    fn test_record_operation() {
        record_operation("inc", "store", 0.001, true);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("rollcache_operations_total"));
        assert!(metrics.contains("rollcache_operation_duration_seconds"));
    }

    #[test]
    fn test_removed_zero_is_skipped() {
        let before = ENTRIES_REMOVED_TOTAL
            .with_label_values(&["sorted", "test"])
            .get();
        record_entries_removed("sorted", "test", 0);
        record_entries_removed("sorted", "test", 3);
        let after = ENTRIES_REMOVED_TOTAL
            .with_label_values(&["sorted", "test"])
            .get();
        assert_eq!(after - before, 3.0);
    }
}
