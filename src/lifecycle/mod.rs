//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Init logging/metrics → Gate::new → Gate::start
//!
//! Shutdown:
//!     Signal received (signals.rs)
//!     → Shutdown::trigger (shutdown.rs)
//!     → Gate::destroy stops every manager's timers, fails queued admissions
//! ```
//!
//! # Design Decisions
//! - Each manager owns its own Shutdown so it can be destroyed in isolation (tests)
//! - Destroy is idempotent

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown_signal;
