//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gate_checks_total` (counter): security checks by operation and outcome
//! - `gate_denials_total` (counter): denials by error code
//! - `gate_rate_limited_total` (counter): rate-limit denials by operation
//! - `gate_security_events_total` (counter): audit events by type and severity
//! - `gate_operation_duration_seconds` (histogram): tool latency by operation
//! - `gate_in_flight_operations` (gauge)
//! - `gate_cache_size_bytes` / `gate_cache_entries` (gauges)
//! - `gate_degradation_level` (gauge): 0=none .. 3=aggressive
//! - `gate_admission_queue_length` (gauge)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no recorder installed
//!   every call is a no-op, so tests need no setup

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_check(operation: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    metrics::counter!(
        "gate_checks_total",
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_denial(code: &'static str) {
    metrics::counter!("gate_denials_total", "code" => code).increment(1);
}

pub fn record_rate_limited(operation: &str) {
    metrics::counter!("gate_rate_limited_total", "operation" => operation.to_string()).increment(1);
}

pub fn record_security_event(event_type: &'static str, severity: &'static str) {
    metrics::counter!(
        "gate_security_events_total",
        "type" => event_type,
        "severity" => severity
    )
    .increment(1);
}

pub fn record_operation_duration(operation: &str, elapsed: Duration) {
    metrics::histogram!(
        "gate_operation_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_in_flight(count: usize) {
    metrics::gauge!("gate_in_flight_operations").set(count as f64);
}

pub fn record_cache_usage(cache_type: &str, size_bytes: u64, entries: usize) {
    metrics::gauge!("gate_cache_size_bytes", "cache" => cache_type.to_string()).set(size_bytes as f64);
    metrics::gauge!("gate_cache_entries", "cache" => cache_type.to_string()).set(entries as f64);
}

pub fn record_cache_evictions(cache_type: &str, count: usize) {
    metrics::counter!("gate_cache_evictions_total", "cache" => cache_type.to_string())
        .increment(count as u64);
}

pub fn record_degradation_level(level: u8) {
    metrics::gauge!("gate_degradation_level").set(level as f64);
}

pub fn record_memory_usage(bytes: u64) {
    metrics::gauge!("gate_memory_usage_bytes").set(bytes as f64);
}

pub fn record_admission_queue(length: usize) {
    metrics::gauge!("gate_admission_queue_length").set(length as f64);
}
