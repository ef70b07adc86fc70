//! Prometheus metrics for the processing loop

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Per-event outcome: acknowledged | persist_failed | ack_stale
    static ref EVENTS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "log_processor_events_total",
        "Stream events handled by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref ANOMALIES_DETECTED: IntCounterVec = register_int_counter_vec!(
        "log_processor_anomalies_total",
        "Events classified as anomalous, by level",
        &["level"]
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref BATCHES_PULLED: IntCounter = register_int_counter!(
        "log_processor_batches_total",
        "Non-empty batches read from the stream"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref EVENTS_RECLAIMED: IntCounter = register_int_counter!(
        "log_processor_reclaimed_events_total",
        "Stale pending entries claimed from other consumers"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref SUPERVISOR_FAULTS: IntCounter = register_int_counter!(
        "log_processor_faults_total",
        "Times the supervisor entered the faulted state"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref PENDING_ENTRIES: IntGauge = register_int_gauge!(
        "log_processor_pending_entries",
        "Entries delivered to the consumer group but not acknowledged"
    ).expect("Prometheus metrics registration should succeed at startup");

    static ref WRITE_DURATION: HistogramVec = register_histogram_vec!(
        "log_processor_write_duration_seconds",
        "Time spent persisting one record",
        &["result"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub fn record_outcome(outcome: &str) {
    EVENTS_PROCESSED.with_label_values(&[outcome]).inc();
}

pub fn record_anomaly(level: &str) {
    ANOMALIES_DETECTED.with_label_values(&[level]).inc();
}

pub fn record_batch() {
    BATCHES_PULLED.inc();
}

pub fn record_reclaimed(count: usize) {
    EVENTS_RECLAIMED.inc_by(count as u64);
}

pub fn record_fault() {
    SUPERVISOR_FAULTS.inc();
}

pub fn set_pending(count: usize) {
    PENDING_ENTRIES.set(count as i64);
}

pub fn observe_write(elapsed: Duration, ok: bool) {
    WRITE_DURATION
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .observe(elapsed.as_secs_f64());
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
