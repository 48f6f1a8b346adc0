//! Governance layer for multi-tenant tool execution.
//!
//! Every operation passes through [`Gate`] before business logic runs:
//! rate limiting, resource admission, suspicious-activity detection and
//! parameter sanitization. Tool handlers plug in through [`ToolHandler`].

pub mod admin;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod observability;
pub mod resources;
pub mod security;

pub use config::GateConfig;
pub use error::{CheckFailure, ErrorCode, GateError, GateResult};
pub use gate::{Gate, ToolContext, ToolHandler, ToolOutput};
pub use lifecycle::Shutdown;
pub use security::{SecurityCheckRequest, SecurityCheckResult};
