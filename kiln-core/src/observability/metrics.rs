//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Build metrics
    describe_histogram!("kiln_build_duration_seconds", "Build duration (by outcome)");
    describe_counter!(
        "kiln_builds_total",
        "Total number of builds (by outcome: success, failed_step, error, cancelled)"
    );
    describe_counter!(
        "kiln_build_rejections_total",
        "Total number of builds rejected because another build was running"
    );

    // Interactive process metrics
    describe_counter!("kiln_processes_started_total", "Total number of interactive processes started");
    describe_gauge!("kiln_process_count", "Current number of tracked interactive processes");
    describe_counter!(
        "kiln_io_cancellations_total",
        "Total number of invocations whose IO attachment was revoked"
    );
}

/// Helper functions for common metric patterns
pub fn record_build(duration_secs: f64, outcome: &str) {
    histogram!("kiln_build_duration_seconds", "outcome" => outcome.to_string()).record(duration_secs);
    counter!("kiln_builds_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_build_rejected() {
    counter!("kiln_build_rejections_total").increment(1);
}

pub fn record_process_started() {
    counter!("kiln_processes_started_total").increment(1);
}

pub fn set_process_count(count: usize) {
    gauge!("kiln_process_count").set(count as f64);
}

pub fn record_io_cancelled() {
    counter!("kiln_io_cancellations_total").increment(1);
}
