//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Gate::check_security(op, caller, params):
//!     → middleware.rs orchestrates, in order:
//!         → rate_limit.rs (per operation and caller window)
//!         → resources::ResourceManager (admission, operation gate)
//!         → audit.rs (input analysis, risk score, event history)
//!         → fields.rs + sanitizer.rs (per-field cleaning)
//!     → SecurityCheckResult
//!
//! Admin responses:
//!     → headers.rs (CSP and friends)
//! ```
//!
//! # Design Decisions
//! - Fail closed: errors and panics deny the request
//! - No trust in client input; the tool sees only sanitized parameters

pub mod audit;
pub mod fields;
pub mod headers;
pub mod middleware;
pub mod rate_limit;
pub mod sanitizer;

pub use audit::{
    EventType, InputAnalysis, NewSecurityEvent, SecurityAuditor, SecurityEvent, SecurityMetrics,
    SecurityReport, Severity,
};
pub use middleware::{SecurityCheckRequest, SecurityCheckResult, SecurityMiddleware};
pub use rate_limit::{RateLimitInfo, RateLimiter, RateLimiterStats};
pub use sanitizer::{
    sanitize_color_input, sanitize_html, sanitize_url, validate_file_content, FileKind, HtmlOptions,
};
