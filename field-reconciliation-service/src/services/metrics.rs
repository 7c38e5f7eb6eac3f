//! Prometheus metrics for field-reconciliation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for store operation duration.
pub static STORE_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "field_reconciliation_store_operation_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register STORE_OPERATION_DURATION")
});

/// Counter for reconciliation passes by final status.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "field_reconciliation_sync_runs_total",
        "Total number of reconciliation passes",
        &["status"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Counter for engine and manual decisions by resulting status.
pub static MATCH_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "field_reconciliation_match_decisions_total",
        "Total number of match decisions",
        &["status"]
    )
    .expect("Failed to register MATCH_DECISIONS")
});

/// Counter for feed items dropped at the ingestion boundary.
pub static SKIPPED_ITEMS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "field_reconciliation_skipped_items_total",
        "Total number of feed items skipped during ingestion",
        &["source"]
    )
    .expect("Failed to register SKIPPED_ITEMS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "field_reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&STORE_OPERATION_DURATION);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&MATCH_DECISIONS);
    Lazy::force(&SKIPPED_ITEMS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_sync_run(status: &str) {
    SYNC_RUNS.with_label_values(&[status]).inc();
}

pub fn record_match_decision(status: &str) {
    MATCH_DECISIONS.with_label_values(&[status]).inc();
}

pub fn record_skipped_item(source: &str) {
    SKIPPED_ITEMS.with_label_values(&[source]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
