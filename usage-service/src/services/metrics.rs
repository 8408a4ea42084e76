//! Metrics module for usage-service.
//! Provides Prometheus metrics for event processing and attribution.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "usage_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Events processed by outcome: processed, skipped, dropped, failed
pub static EVENTS_PROCESSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Feature usage rows written (per-tenant metering)
pub static FEATURE_USAGE_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Attribution duration by strategy
pub static ATTRIBUTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Events re-published by reprocessing runs
pub static EVENTS_REPROCESSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    EVENTS_PROCESSED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_events_processed_total",
                "Total events handled by the tracking pipeline by outcome"
            ),
            &["tenant_id", "outcome"]
        )
        .expect("Failed to register EVENTS_PROCESSED_TOTAL")
    });

    FEATURE_USAGE_RECORDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_feature_usage_records_total",
                "Total feature usage records inserted by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register FEATURE_USAGE_RECORDS_TOTAL")
    });

    ATTRIBUTION_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "usage_attribution_duration_seconds",
                "Time spent attributing one event",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["strategy"]
        )
        .expect("Failed to register ATTRIBUTION_DURATION")
    });

    EVENTS_REPROCESSED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "usage_events_reprocessed_total",
                "Total events re-published for reprocessing"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register EVENTS_REPROCESSED_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record the outcome of one inbound event.
pub fn record_event_outcome(tenant_id: &str, outcome: &str) {
    if let Some(counter) = EVENTS_PROCESSED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, outcome]).inc();
    }
}

/// Record inserted feature usage rows.
pub fn record_feature_usage_written(tenant_id: &str, count: usize) {
    if let Some(counter) = FEATURE_USAGE_RECORDS_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc_by(count as u64);
    }
}

pub fn record_attribution_duration(strategy: &str, duration_secs: f64) {
    if let Some(histogram) = ATTRIBUTION_DURATION.get() {
        histogram.with_label_values(&[strategy]).observe(duration_secs);
    }
}

pub fn record_events_reprocessed(tenant_id: &str, count: usize) {
    if let Some(counter) = EVENTS_REPROCESSED_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc_by(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn recorded_outcomes_show_up_in_exposition() {
        init_metrics();
        record_event_outcome("tenant_metrics", "processed");
        record_feature_usage_written("tenant_metrics", 2);

        let text = get_metrics();
        assert!(text.contains("usage_events_processed_total"));
        assert!(text.contains("tenant_metrics"));
    }
}
