//! Pressure-driven admission control.
//!
//! # Data Flow
//! ```text
//! should_allow_request(op)
//!     → current_usage(): memory probe + monitor in-flight + cache total
//!     → degradation_strategy(usage)
//!         none       → allow
//!         light      → sleep throttle_delay (+ jitter), allow
//!         moderate   → park in FIFO queue until pressure < moderate or timeout
//!         aggressive → reject
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::CacheManager;
use crate::config::ResourceConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resources::admission::{AdmissionError, AdmissionQueue, AdmissionResult};
use crate::resources::monitor::PerformanceMonitor;
use crate::resources::quality::{
    degradation_strategy, DegradationLevel, DegradationStrategy, QualitySettings, UsageSnapshot,
};

/// Fraction of each cache evicted under moderate pressure.
const MODERATE_TRIM_FRACTION: f64 = 0.25;

/// Source of the process memory figure.
pub trait MemoryProbe: Send + Sync + Debug {
    fn resident_bytes(&self) -> u64;
}

/// Resident set size from `/proc/self/statm`, or 0 where that is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatmMemory;

const PAGE_SIZE: u64 = 4096;

impl MemoryProbe for ProcStatmMemory {
    fn resident_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
            .map(|pages| pages * PAGE_SIZE)
            .unwrap_or(0)
    }
}

/// Settable memory figure.
#[derive(Debug, Default)]
pub struct FixedMemory(AtomicU64);

impl FixedMemory {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    fn resident_bytes(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl From<DegradationLevel> for HealthStatus {
    fn from(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::None => HealthStatus::Healthy,
            DegradationLevel::Light | DegradationLevel::Moderate => HealthStatus::Warning,
            DegradationLevel::Aggressive => HealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub status: HealthStatus,
    pub usage: UsageSnapshot,
    pub strategy: DegradationStrategy,
    pub queue_length: usize,
}

/// Outcome of [`ResourceManager::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_cache_entries: usize,
    pub rejected_waiters: usize,
}

pub struct ResourceManager {
    config: ResourceConfig,
    monitor: Arc<PerformanceMonitor>,
    caches: Arc<CacheManager>,
    memory: Arc<dyn MemoryProbe>,
    queue: AdmissionQueue,
    last_level: AtomicU8,
    shutdown: Shutdown,
}

impl ResourceManager {
    pub fn new(
        config: ResourceConfig,
        monitor: Arc<PerformanceMonitor>,
        caches: Arc<CacheManager>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            config,
            monitor,
            caches,
            memory,
            queue: AdmissionQueue::new(),
            last_level: AtomicU8::new(DegradationLevel::None.as_u8()),
            shutdown: Shutdown::new(),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn current_usage(&self) -> UsageSnapshot {
        UsageSnapshot {
            memory_usage_bytes: self.memory.resident_bytes(),
            concurrent_requests: self.monitor.in_flight(),
            cache_size_bytes: self.caches.total_size(),
        }
    }

    pub fn degradation_strategy(&self, usage: &UsageSnapshot) -> DegradationStrategy {
        degradation_strategy(usage, &self.config)
    }

    pub fn current_strategy(&self) -> DegradationStrategy {
        let strategy = self.degradation_strategy(&self.current_usage());
        self.note_level(strategy.level);
        strategy
    }

    fn note_level(&self, level: DegradationLevel) {
        let previous = DegradationLevel::from_u8(self.last_level.swap(level.as_u8(), Ordering::SeqCst));
        if previous != level {
            metrics::record_degradation_level(level.as_u8());
            if level > previous {
                tracing::warn!(from = previous.as_str(), to = level.as_str(), "Degradation level raised");
            } else {
                tracing::info!(from = previous.as_str(), to = level.as_str(), "Degradation level lowered");
            }
        }
    }

    /// Decide admission for one request, waiting if pressure is moderate.
    pub async fn should_allow_request(self: &Arc<Self>, operation: &str) -> AdmissionResult {
        if self.shutdown.is_triggered() {
            return Err(AdmissionError::ShuttingDown);
        }

        let strategy = self.current_strategy();
        match strategy.level {
            DegradationLevel::None => Ok(()),
            DegradationLevel::Light => {
                let jitter_cap = (self.config.throttle_delay_ms / 4).max(1);
                let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
                time::sleep(Duration::from_millis(self.config.throttle_delay_ms + jitter)).await;
                Ok(())
            }
            DegradationLevel::Moderate => self.wait_for_admission(operation).await,
            DegradationLevel::Aggressive => {
                tracing::warn!(
                    operation = %operation,
                    pressure = strategy.pressure,
                    "Request rejected under aggressive degradation"
                );
                Err(AdmissionError::Rejected {
                    reason: format!("pressure {:.2}", strategy.pressure),
                })
            }
        }
    }

    async fn wait_for_admission(self: &Arc<Self>, operation: &str) -> AdmissionResult {
        if self.queue.len() >= self.config.max_queue_size {
            tracing::warn!(operation = %operation, "Admission queue full");
            return Err(AdmissionError::QueueOverflow);
        }

        let (id, rx) = self.queue.enqueue(operation)?;
        metrics::record_admission_queue(self.queue.len());
        tracing::debug!(operation = %operation, queue_length = self.queue.len(), "Request queued");
        self.ensure_drain();

        let timeout = Duration::from_millis(self.config.queue_timeout_ms);
        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdmissionError::ShuttingDown),
            Err(_) => {
                self.queue.remove(id);
                metrics::record_admission_queue(self.queue.len());
                tracing::warn!(operation = %operation, "Admission queue wait timed out");
                Err(AdmissionError::QueueTimeout {
                    waited_ms: self.config.queue_timeout_ms,
                })
            }
        }
    }

    fn ensure_drain(self: &Arc<Self>) {
        if !self.queue.try_begin_drain() {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let poll = Duration::from_millis(manager.config.queue_poll_interval_ms);
            loop {
                time::sleep(poll).await;
                if manager.queue.is_closed() {
                    manager.queue.end_drain();
                    break;
                }
                if manager.current_strategy().level < DegradationLevel::Moderate {
                    let released = manager.queue.release_all();
                    if released > 0 {
                        tracing::debug!(released, "Admission queue drained");
                    }
                    metrics::record_admission_queue(manager.queue.len());
                }
                if manager.queue.is_empty() {
                    manager.queue.end_drain();
                    // A waiter may have arrived between the check and the flag clear.
                    if manager.queue.is_empty() || !manager.queue.try_begin_drain() {
                        break;
                    }
                }
            }
        });
    }

    /// False for expensive operations while degradation is aggressive.
    pub fn is_operation_allowed(&self, operation: &str) -> bool {
        if !self.is_expensive(operation) {
            return true;
        }
        self.current_strategy().level < DegradationLevel::Aggressive
    }

    pub fn is_expensive(&self, operation: &str) -> bool {
        self.config
            .expensive_operations
            .iter()
            .any(|op| op == operation)
    }

    pub fn quality_settings(&self, operation: &str) -> QualitySettings {
        QualitySettings::for_operation(self.current_strategy().level, self.is_expensive(operation))
    }

    pub fn resource_status(&self) -> ResourceStatus {
        let usage = self.current_usage();
        let strategy = self.degradation_strategy(&usage);
        ResourceStatus {
            status: strategy.level.into(),
            usage,
            strategy,
            queue_length: self.queue.len(),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    /// Sweep expired cache entries and cut the queue back to its bound.
    pub fn cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            expired_cache_entries: self.caches.sweep_expired(),
            rejected_waiters: self.queue.trim(self.config.max_queue_size),
        };
        if report.expired_cache_entries > 0 || report.rejected_waiters > 0 {
            tracing::debug!(
                expired = report.expired_cache_entries,
                rejected = report.rejected_waiters,
                "Resource cleanup"
            );
        }
        report
    }

    /// Take one sample and apply the cache actions of the resulting level.
    pub fn sample(&self) -> DegradationStrategy {
        let usage = self.current_usage();
        let strategy = self.degradation_strategy(&usage);
        self.note_level(strategy.level);

        metrics::record_memory_usage(usage.memory_usage_bytes);
        metrics::record_in_flight(usage.concurrent_requests);
        metrics::record_admission_queue(self.queue.len());
        for (name, stats) in self.caches.stats() {
            metrics::record_cache_usage(&name, stats.size_bytes, stats.entries);
        }

        match strategy.level {
            DegradationLevel::None => {}
            DegradationLevel::Light => {
                self.cleanup();
            }
            DegradationLevel::Moderate => {
                let trimmed = self.caches.trim(MODERATE_TRIM_FRACTION);
                tracing::info!(trimmed, "Trimmed caches under moderate pressure");
            }
            DegradationLevel::Aggressive => {
                self.caches.clear(None);
                self.cleanup();
                tracing::warn!(pressure = strategy.pressure, "Cleared caches under aggressive pressure");
            }
        }
        strategy
    }

    /// Spawn the periodic sampler.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let mut shutdown = self.shutdown.subscribe();
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(manager.config.sample_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sample();
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Resource sampler stopped");
                        break;
                    }
                }
            }
        }))
    }

    /// Stop sampling and fail every queued caller.
    pub fn destroy(&self) {
        self.shutdown.trigger();
        let failed = self.queue.close();
        if failed > 0 {
            tracing::info!(failed, "Failed queued requests on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheSettings;

    struct Fixture {
        manager: Arc<ResourceManager>,
        memory: Arc<FixedMemory>,
        monitor: Arc<PerformanceMonitor>,
        caches: Arc<CacheManager>,
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(FixedMemory::new(0));
        let monitor = Arc::new(PerformanceMonitor::new());
        let caches = Arc::new(CacheManager::new(
            CacheSettings::default(),
            Arc::new(ManualClock::new(0)),
        ));
        let config = ResourceConfig {
            memory_limit_bytes: 1_000,
            ..ResourceConfig::default()
        };
        let manager = Arc::new(ResourceManager::new(
            config,
            monitor.clone(),
            caches.clone(),
            memory.clone(),
        ));
        Fixture {
            manager,
            memory,
            monitor,
            caches,
        }
    }

    #[tokio::test]
    async fn test_none_allows() {
        let f = fixture();
        assert_eq!(f.manager.should_allow_request("convert_color").await, Ok(()));
        assert_eq!(f.manager.resource_status().status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_throttles() {
        let f = fixture();
        f.memory.set(650);
        let started = time::Instant::now();
        assert_eq!(f.manager.should_allow_request("convert_color").await, Ok(()));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(f.manager.resource_status().status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_aggressive_rejects_everything() {
        let f = fixture();
        f.memory.set(950);
        for op in ["convert_color", "create_palette_png"] {
            assert!(matches!(
                f.manager.should_allow_request(op).await,
                Err(AdmissionError::Rejected { .. })
            ));
        }
        assert!(!f.manager.is_operation_allowed("create_palette_png"));
        assert!(f.manager.is_operation_allowed("convert_color"));
        assert_eq!(f.manager.resource_status().status, HealthStatus::Critical);
    }

    #[test]
    fn test_concurrency_counts_toward_pressure() {
        let f = fixture();
        let guards: Vec<_> = (0..45).map(|_| f.monitor.begin("convert_color")).collect();
        assert_eq!(f.manager.current_usage().concurrent_requests, 45);
        assert_eq!(f.manager.current_strategy().level, DegradationLevel::Aggressive);
        drop(guards);
        assert_eq!(f.manager.current_strategy().level, DegradationLevel::None);
    }

    #[test]
    fn test_quality_follows_level() {
        let f = fixture();
        assert_eq!(
            f.manager.quality_settings("convert_color"),
            QualitySettings::for_level(DegradationLevel::None)
        );
        f.memory.set(800);
        assert_eq!(
            f.manager.quality_settings("convert_color"),
            QualitySettings::for_level(DegradationLevel::Moderate)
        );
        assert_eq!(
            f.manager.quality_settings("create_gradient_png"),
            QualitySettings::for_level(DegradationLevel::Aggressive)
        );
    }

    #[test]
    fn test_sample_applies_cache_actions() {
        let f = fixture();
        for i in 0..8 {
            f.caches
                .set("palette", format!("k{}", i), serde_json::json!(i))
                .unwrap();
        }
        f.memory.set(800);
        f.manager.sample();
        assert_eq!(f.caches.total_entries(), 6);

        f.memory.set(950);
        f.manager.sample();
        assert_eq!(f.caches.total_entries(), 0);
    }
}
