//! Error codes and crate-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, caller-facing reason codes carried in a denied check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Retry after the advertised `retry_after_ms`.
    RateLimitExceeded,
    /// Retry later; no hint is guaranteed.
    ResourceExhausted,
    /// Temporarily disabled at the current degradation level.
    OperationDisabled,
    /// Malicious or blocked input. Not recoverable for this request.
    SecurityBlocked,
    /// The caller must fix its parameters.
    ValidationFailed,
    /// Unexpected fault. The request is denied.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::OperationDisabled => "OPERATION_DISABLED",
            ErrorCode::SecurityBlocked => "SECURITY_BLOCKED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimitExceeded | ErrorCode::ResourceExhausted | ErrorCode::OperationDisabled
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failure reported in a check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl CheckFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors surfaced by the gate outside of the check pipeline.
#[derive(Debug, Error)]
pub enum GateError {
    /// Configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parameters could not be serialized for inspection.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tool handler failed.
    #[error("Tool handler failed: {0}")]
    Handler(String),

    /// The request was denied by the check pipeline.
    #[error("Request denied: {0}")]
    Denied(CheckFailure),

    /// An invariant was violated inside the pipeline.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::security::fields::FieldTableError> for GateError {
    fn from(e: crate::security::fields::FieldTableError) -> Self {
        GateError::Config(e.to_string())
    }
}

/// Result type for gate operations.
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::RateLimitExceeded.as_str(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(ErrorCode::InternalError.to_string(), "INTERNAL_ERROR");
        let json = serde_json::to_string(&ErrorCode::SecurityBlocked).unwrap();
        assert_eq!(json, "\"SECURITY_BLOCKED\"");
    }

    #[test]
    fn test_recoverable_codes() {
        assert!(ErrorCode::RateLimitExceeded.is_recoverable());
        assert!(ErrorCode::ResourceExhausted.is_recoverable());
        assert!(!ErrorCode::SecurityBlocked.is_recoverable());
        assert!(!ErrorCode::InternalError.is_recoverable());
    }

    #[test]
    fn test_failure_display() {
        let failure = CheckFailure::new(ErrorCode::ValidationFailed, "missing color");
        assert_eq!(failure.to_string(), "VALIDATION_FAILED: missing color");
        let err = GateError::Denied(failure);
        assert!(err.to_string().contains("missing color"));
    }
}
