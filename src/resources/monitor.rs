//! In-flight tracking, latency and cache hit rate.
//!
//! # Responsibilities
//! - Count operations currently executing (a concurrency pressure signal)
//! - Record per-operation latency and failures
//! - Track cache hits and misses seen by the execution path

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::observability::metrics;

#[derive(Debug, Default, Clone, Copy)]
struct LatencyTotals {
    count: u64,
    failures: u64,
    total_ms: u64,
    max_ms: u64,
}

/// Latency summary for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub failures: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub in_flight: usize,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub operations: BTreeMap<String, OperationStats>,
}

/// Process-wide performance counters.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    in_flight: AtomicUsize,
    total_operations: AtomicU64,
    failed_operations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency: DashMap<String, LatencyTotals>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking one operation. The count drops when the guard does.
    pub fn begin(self: &Arc<Self>, operation: &str) -> OperationGuard {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_in_flight(in_flight);
        OperationGuard {
            monitor: Arc::clone(self),
            operation: operation.to_string(),
            started: Instant::now(),
            failed: true,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    fn finish(&self, operation: &str, elapsed_ms: u64, failed: bool) {
        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::record_in_flight(in_flight);
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
        }

        let mut totals = self.latency.entry(operation.to_string()).or_default();
        totals.count += 1;
        totals.total_ms += elapsed_ms;
        totals.max_ms = totals.max_ms.max(elapsed_ms);
        if failed {
            totals.failures += 1;
        }
    }

    pub fn stats(&self) -> PerformanceStats {
        let operations = self
            .latency
            .iter()
            .map(|entry| {
                let t = *entry.value();
                let avg_ms = if t.count == 0 {
                    0.0
                } else {
                    t.total_ms as f64 / t.count as f64
                };
                (
                    entry.key().clone(),
                    OperationStats {
                        count: t.count,
                        failures: t.failures,
                        avg_ms,
                        max_ms: t.max_ms,
                    },
                )
            })
            .collect();

        PerformanceStats {
            in_flight: self.in_flight(),
            total_operations: self.total_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            operations,
        }
    }
}

/// Tracks one executing operation.
///
/// Counts as failed unless [`OperationGuard::succeed`] is called first.
pub struct OperationGuard {
    monitor: Arc<PerformanceMonitor>,
    operation: String,
    started: Instant,
    failed: bool,
}

impl OperationGuard {
    pub fn succeed(&mut self) {
        self.failed = false;
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        metrics::record_operation_duration(&self.operation, elapsed);
        self.monitor
            .finish(&self.operation, elapsed.as_millis() as u64, self.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_in_flight() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let mut a = monitor.begin("convert_color");
        let b = monitor.begin("create_palette_png");
        assert_eq!(monitor.in_flight(), 2);

        a.succeed();
        drop(a);
        assert_eq!(monitor.in_flight(), 1);
        drop(b);
        assert_eq!(monitor.in_flight(), 0);

        let stats = monitor.stats();
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.failed_operations, 1);
        assert_eq!(stats.operations["convert_color"].failures, 0);
        assert_eq!(stats.operations["create_palette_png"].failures, 1);
    }

    #[test]
    fn test_cache_hit_rate() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.cache_hit_rate(), 0.0);
        monitor.record_cache_hit();
        monitor.record_cache_hit();
        monitor.record_cache_hit();
        monitor.record_cache_miss();
        assert!((monitor.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
