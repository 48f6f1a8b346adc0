//! Resource pressure and admission control.
//!
//! # Data Flow
//! ```text
//! Gate::execute
//!     → monitor.rs begin(op): in-flight +1 until the guard drops
//!
//! Security middleware (admission step)
//!     → manager.rs should_allow_request(op)
//!         → quality.rs degradation_strategy(usage)
//!         → admission.rs FIFO queue under moderate pressure
//!     → manager.rs is_operation_allowed(op)
//!
//! Background sampler (manager.rs start)
//!     → gauges, cache trim (moderate) / clear (aggressive)
//! ```
//!
//! # Design Decisions
//! - Degradation is a pure function of a usage snapshot; only admission
//!   and the sampler act on it
//! - Queue waits use Tokio time so tests can pause the clock

pub mod admission;
pub mod manager;
pub mod monitor;
pub mod quality;

pub use admission::{AdmissionError, AdmissionQueue, AdmissionResult};
pub use manager::{
    CleanupReport, FixedMemory, HealthStatus, MemoryProbe, ProcStatmMemory, ResourceManager,
    ResourceStatus,
};
pub use monitor::{OperationGuard, OperationStats, PerformanceMonitor, PerformanceStats};
pub use quality::{
    degradation_strategy, DegradationAction, DegradationLevel, DegradationStrategy,
    QualitySettings, UsageSnapshot,
};
