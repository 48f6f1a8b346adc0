//! Per-request security pipeline.
//!
//! # Data Flow
//! ```text
//! check_security(request)
//!     1. rate limit          → RATE_LIMIT_EXCEEDED
//!     2. resource admission  → RESOURCE_EXHAUSTED
//!     3. operation gate      → OPERATION_DISABLED
//!     4. suspicion scoring   → SECURITY_BLOCKED (critical) or warnings
//!     5. field sanitization  → SECURITY_BLOCKED (URL) / VALIDATION_FAILED
//!     6. structural checks   → VALIDATION_FAILED
//! ```
//!
//! # Design Decisions
//! - The first failing step ends the check
//! - Step 4 reads the raw parameters; steps 5 and 6 work on the cleaned copy
//! - Any error or panic inside the pipeline becomes one INTERNAL_ERROR denial

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::SharedClock;
use crate::config::SecurityConfig;
use crate::error::{CheckFailure, ErrorCode, GateResult};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resources::ResourceManager;
use crate::security::audit::{EventType, NewSecurityEvent, SecurityAuditor, Severity};
use crate::security::fields::{
    self, FieldKind, FieldTableError, FIELD_RULES, GENERATIVE_OPERATIONS, IMAGE_OPERATIONS,
    PALETTE_SIZE_FIELDS, REQUIRED_PARAMETERS,
};
use crate::security::rate_limit::{RateLimitInfo, RateLimiter};
use crate::security::sanitizer::{self, HtmlOptions};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// One inbound operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityCheckRequest {
    pub operation: String,
    pub caller_id: String,
    #[serde(default)]
    pub parameters: Value,
}

impl SecurityCheckRequest {
    pub fn new(operation: impl Into<String>, caller_id: impl Into<String>, parameters: Value) -> Self {
        Self {
            operation: operation.into(),
            caller_id: caller_id.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityCheckResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_parameters: Option<Value>,
    pub errors: Vec<CheckFailure>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<RateLimitInfo>,
}

impl SecurityCheckResult {
    fn denied(errors: Vec<CheckFailure>, rate_limit_info: Option<RateLimitInfo>) -> Self {
        Self {
            allowed: false,
            sanitized_parameters: None,
            errors,
            warnings: Vec::new(),
            rate_limit_info,
        }
    }

    /// Whether any error carries `code`.
    pub fn has_error(&self, code: ErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

#[derive(Debug, Clone, Copy)]
struct RecentRequest {
    at: u64,
    expensive: bool,
}

/// Field-level cleaning outcome.
#[derive(Default)]
struct Sanitized {
    errors: Vec<CheckFailure>,
    warnings: Vec<String>,
    blocked_urls: Vec<String>,
}

pub struct SecurityMiddleware {
    config: SecurityConfig,
    rate_limiter: Arc<RateLimiter>,
    resources: Arc<ResourceManager>,
    auditor: Arc<SecurityAuditor>,
    clock: SharedClock,
    recent: DashMap<String, VecDeque<RecentRequest>>,
    shutdown: Shutdown,
}

impl SecurityMiddleware {
    /// Build the pipeline. Fails if the field tables are inconsistent.
    pub fn new(
        config: SecurityConfig,
        rate_limiter: Arc<RateLimiter>,
        resources: Arc<ResourceManager>,
        auditor: Arc<SecurityAuditor>,
        clock: SharedClock,
    ) -> Result<Self, FieldTableError> {
        fields::validate_tables(FIELD_RULES, REQUIRED_PARAMETERS)?;
        Ok(Self {
            config,
            rate_limiter,
            resources,
            auditor,
            clock,
            recent: DashMap::new(),
            shutdown: Shutdown::new(),
        })
    }

    /// Run every check for one request. Never fails; denials are in the result.
    pub async fn check_security(&self, request: &SecurityCheckRequest) -> SecurityCheckResult {
        let outcome = AssertUnwindSafe(self.run_pipeline(request))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => self.fail_closed(request, e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                self.fail_closed(request, message)
            }
        };

        metrics::record_check(&request.operation, result.allowed);
        for error in &result.errors {
            metrics::record_denial(error.code.as_str());
        }
        if !result.allowed {
            tracing::info!(
                operation = %request.operation,
                caller_id = %request.caller_id,
                errors = result.errors.len(),
                code = result.errors.first().map(|e| e.code.as_str()).unwrap_or(""),
                "Request denied"
            );
        }
        result
    }

    fn fail_closed(&self, request: &SecurityCheckRequest, message: String) -> SecurityCheckResult {
        tracing::error!(
            operation = %request.operation,
            caller_id = %request.caller_id,
            error = %message,
            "Security check failed internally"
        );
        let event = NewSecurityEvent::new(
            EventType::SuspiciousActivity,
            Severity::High,
            request.operation.clone(),
            request.caller_id.clone(),
        )
        .detail("reason", "internal_error")
        .detail("error", message);
        // The fault may have poisoned the audit lock.
        let logged = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.auditor.log_security_event(event);
        }));
        if logged.is_err() {
            tracing::error!("Failed to record internal error event");
        }

        SecurityCheckResult::denied(
            vec![CheckFailure::new(
                ErrorCode::InternalError,
                "Internal error during security check",
            )],
            None,
        )
    }

    fn log_event(
        &self,
        event_type: EventType,
        severity: Severity,
        request: &SecurityCheckRequest,
        details: &[(&str, Value)],
    ) {
        let mut event = NewSecurityEvent::new(
            event_type,
            severity,
            request.operation.clone(),
            request.caller_id.clone(),
        );
        for (key, value) in details {
            event = event.detail(key, value.clone());
        }
        self.auditor.log_security_event(event);
    }

    async fn run_pipeline(&self, request: &SecurityCheckRequest) -> GateResult<SecurityCheckResult> {
        let operation = request.operation.as_str();
        let caller_id = request.caller_id.as_str();

        // 1. rate limit
        let rate_info = self.rate_limiter.check_rate_limit(operation, caller_id, None);
        if !rate_info.allowed {
            let retry_after = rate_info.retry_after_ms.unwrap_or(0);
            self.log_event(
                EventType::RateLimit,
                Severity::Medium,
                request,
                &[("retry_after_ms", Value::from(retry_after))],
            );
            return Ok(SecurityCheckResult::denied(
                vec![CheckFailure::new(
                    ErrorCode::RateLimitExceeded,
                    format!(
                        "Rate limit exceeded for {}; retry after {}ms",
                        operation, retry_after
                    ),
                )],
                Some(rate_info),
            ));
        }

        // 2. resource admission
        if let Err(e) = self.resources.should_allow_request(operation).await {
            self.log_event(
                EventType::ResourceAbuse,
                Severity::High,
                request,
                &[("reason", Value::from(e.to_string()))],
            );
            return Ok(SecurityCheckResult::denied(
                vec![CheckFailure::new(ErrorCode::ResourceExhausted, e.to_string())],
                Some(rate_info),
            ));
        }

        // 3. operation gate
        if !self.resources.is_operation_allowed(operation) {
            self.log_event(
                EventType::AccessDenied,
                Severity::Medium,
                request,
                &[("reason", Value::from("expensive_operation_disabled"))],
            );
            return Ok(SecurityCheckResult::denied(
                vec![CheckFailure::new(
                    ErrorCode::OperationDisabled,
                    format!("Operation {} is temporarily disabled under load", operation),
                )],
                Some(rate_info),
            ));
        }

        // 4. suspicious activity on the raw parameters
        let (severity, reasons) = self.assess_suspicion(request)?;
        if severity == Some(Severity::Critical) {
            self.log_event(
                EventType::SuspiciousActivity,
                Severity::Critical,
                request,
                &[("reasons", Value::from(reasons.clone()))],
            );
            return Ok(SecurityCheckResult::denied(
                vec![CheckFailure::new(
                    ErrorCode::SecurityBlocked,
                    format!("Suspicious activity blocked: {}", reasons.join("; ")),
                )],
                Some(rate_info),
            ));
        }
        let mut warnings: Vec<String> = reasons;

        // 5. field sanitization
        let mut parameters = match &request.parameters {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Ok(SecurityCheckResult::denied(
                    vec![CheckFailure::new(
                        ErrorCode::ValidationFailed,
                        "Parameters must be a JSON object",
                    )],
                    Some(rate_info),
                ))
            }
        };
        let mut sanitized = Sanitized::default();
        sanitize_object(&mut parameters, "", &mut sanitized);

        if !sanitized.blocked_urls.is_empty() {
            self.log_event(
                EventType::InputValidation,
                Severity::High,
                request,
                &[("blocked_urls", Value::from(sanitized.blocked_urls.clone()))],
            );
        }
        if !sanitized.errors.is_empty() {
            return Ok(SecurityCheckResult::denied(sanitized.errors, Some(rate_info)));
        }
        warnings.append(&mut sanitized.warnings);

        // 6. structural validation
        let errors = self.validate_structure(operation, &parameters);
        if !errors.is_empty() {
            return Ok(SecurityCheckResult::denied(errors, Some(rate_info)));
        }

        Ok(SecurityCheckResult {
            allowed: true,
            sanitized_parameters: Some(Value::Object(parameters)),
            errors: Vec::new(),
            warnings,
            rate_limit_info: Some(rate_info),
        })
    }

    /// Highest severity found and the reasons behind it.
    fn assess_suspicion(
        &self,
        request: &SecurityCheckRequest,
    ) -> GateResult<(Option<Severity>, Vec<String>)> {
        let config = &self.config;
        let now = self.clock.now_ms();
        let operation = request.operation.as_str();
        let caller_id = request.caller_id.as_str();
        let expensive = self.resources.is_expensive(operation);

        let (recent_requests, recent_expensive) = self.note_request(caller_id, now, expensive);
        let historical_risk = self.auditor.client_risk_score(caller_id);
        let block_score = self.auditor.client_block_score(caller_id);
        let daily_events = self.auditor.client_event_count(caller_id, DAY_MS);

        let serialized = serde_json::to_string(&request.parameters)?;
        let oversized = serialized.len() > config.max_parameter_bytes;

        let mut findings: Vec<(Severity, String)> = Vec::new();

        if recent_requests > config.recent_request_high {
            findings.push((Severity::High, format!("{} requests in the last minute", recent_requests)));
        } else if recent_requests > config.recent_request_warn {
            findings.push((Severity::Medium, format!("{} requests in the last minute", recent_requests)));
        }

        // Oversized input is blocked below without a scan.
        let analysis = (!oversized).then(|| self.auditor.analyze_input(&serialized, operation, caller_id));
        if let Some(analysis) = analysis.filter(|a| a.is_suspicious) {
            let severity = match analysis.risk_score {
                80.. => Severity::Critical,
                40..=79 => Severity::High,
                _ => Severity::Medium,
            };
            findings.push((
                severity,
                format!("suspicious input: {}", analysis.suspicious_patterns.join(", ")),
            ));
        }

        if recent_expensive > config.expensive_ops_high {
            findings.push((Severity::High, format!("{} expensive operations in 5 minutes", recent_expensive)));
        } else if recent_expensive > config.expensive_ops_warn {
            findings.push((Severity::Medium, format!("{} expensive operations in 5 minutes", recent_expensive)));
        }

        if oversized {
            findings.push((Severity::Critical, format!("parameters too large ({} bytes)", serialized.len())));
        } else if serialized.len() > config.warn_parameter_bytes {
            findings.push((Severity::Medium, format!("large parameters ({} bytes)", serialized.len())));
        }

        // Only non-throttle events count toward a block, so a rate-limited
        // caller recovers once its window resets.
        if block_score >= config.risk_score_block {
            findings.push((Severity::Critical, format!("caller risk score {}", block_score)));
        } else if historical_risk >= config.risk_score_warn {
            findings.push((Severity::High, format!("caller risk score {}", historical_risk)));
        }

        if daily_events > config.daily_events_high {
            findings.push((Severity::High, format!("{} security events in 24 hours", daily_events)));
        } else if daily_events > config.daily_events_warn {
            findings.push((Severity::Medium, format!("{} security events in 24 hours", daily_events)));
        }

        let severity = findings.iter().map(|(s, _)| *s).max();
        let reasons = findings.into_iter().map(|(_, reason)| reason).collect();
        Ok((severity, reasons))
    }

    /// Record this request and return (requests in window, expensive in window).
    fn note_request(&self, caller_id: &str, now: u64, expensive: bool) -> (usize, usize) {
        let recent_since = now.saturating_sub(self.config.recent_request_window_ms);
        let expensive_since = now.saturating_sub(self.config.expensive_window_ms);
        let keep_since = recent_since.min(expensive_since);

        let mut log = self.recent.entry(caller_id.to_string()).or_default();
        log.push_back(RecentRequest { at: now, expensive });
        while log.front().is_some_and(|r| r.at < keep_since) {
            log.pop_front();
        }
        let recent = log.iter().filter(|r| r.at >= recent_since).count();
        let expensive = log
            .iter()
            .filter(|r| r.expensive && r.at >= expensive_since)
            .count();
        (recent, expensive)
    }

    fn validate_structure(&self, operation: &str, parameters: &Map<String, Value>) -> Vec<CheckFailure> {
        let config = &self.config;
        let mut errors = Vec::new();

        for field in fields::required_parameters(operation) {
            if parameters.get(*field).map_or(true, Value::is_null) {
                errors.push(CheckFailure::new(
                    ErrorCode::ValidationFailed,
                    format!("Missing required parameter '{}' for {}", field, operation),
                ));
            }
        }

        let number = |field: &str| parameters.get(field).and_then(Value::as_f64);

        if IMAGE_OPERATIONS.iter().any(|op| *op == operation) {
            let width = number("width");
            let height = number("height");
            for (name, value) in [("width", width), ("height", height)] {
                if let Some(v) = value {
                    if v > config.max_image_dimension as f64 {
                        errors.push(CheckFailure::new(
                            ErrorCode::ValidationFailed,
                            format!("{} {} exceeds maximum {}", name, v, config.max_image_dimension),
                        ));
                    }
                }
            }
            if let (Some(w), Some(h)) = (width, height) {
                if w * h > config.max_image_area as f64 {
                    errors.push(CheckFailure::new(
                        ErrorCode::ValidationFailed,
                        format!("Image area {} exceeds maximum {}", w * h, config.max_image_area),
                    ));
                }
            }
        }

        if GENERATIVE_OPERATIONS.iter().any(|op| *op == operation) {
            for &field in PALETTE_SIZE_FIELDS {
                if let Some(v) = number(field) {
                    if v > config.max_palette_size as f64 {
                        errors.push(CheckFailure::new(
                            ErrorCode::ValidationFailed,
                            format!("{} {} exceeds maximum palette size {}", field, v, config.max_palette_size),
                        ));
                    }
                }
            }
        }

        errors
    }

    /// Drop request history older than both windows.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let keep_since = now
            .saturating_sub(self.config.recent_request_window_ms)
            .min(now.saturating_sub(self.config.expensive_window_ms));
        let before = self.recent.len();
        self.recent.retain(|_, log| {
            while log.front().is_some_and(|r| r.at < keep_since) {
                log.pop_front();
            }
            !log.is_empty()
        });
        before.saturating_sub(self.recent.len())
    }

    pub fn tracked_callers(&self) -> usize {
        self.recent.len()
    }

    /// Spawn the periodic request-history sweep.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let mut shutdown = self.shutdown.subscribe();
        let middleware = Arc::clone(self);

        Some(tokio::spawn(async move {
            let period = middleware
                .config
                .recent_request_window_ms
                .max(middleware.config.expensive_window_ms)
                .max(1);
            let mut ticker = time::interval(Duration::from_millis(period));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = middleware.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept idle caller history");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Request history sweeper stopped");
                        break;
                    }
                }
            }
        }))
    }

    pub fn destroy(&self) {
        self.shutdown.trigger();
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn sanitize_object(map: &mut Map<String, Value>, prefix: &str, out: &mut Sanitized) {
    for (key, value) in map.iter_mut() {
        let path = join_path(prefix, key);
        match fields::rule_for(key).map(|r| r.kind) {
            Some(kind) => sanitize_field(kind, value, &path, out),
            None => sanitize_untyped(value, &path, out),
        }
    }
}

fn sanitize_untyped(value: &mut Value, path: &str, out: &mut Sanitized) {
    match value {
        Value::Object(map) => sanitize_object(map, path, out),
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                sanitize_untyped(item, &format!("{}[{}]", path, i), out);
            }
        }
        _ => {}
    }
}

fn sanitize_field(kind: FieldKind, value: &mut Value, path: &str, out: &mut Sanitized) {
    match kind {
        FieldKind::Color => match value {
            Value::String(s) => sanitize_color(s, path, out),
            _ => out.errors.push(CheckFailure::new(
                ErrorCode::ValidationFailed,
                format!("{} must be a colour string", path),
            )),
        },
        FieldKind::ColorArray => match value {
            Value::Array(_) | Value::Object(_) => sanitize_color_tree(value, path, out),
            _ => out.errors.push(CheckFailure::new(
                ErrorCode::ValidationFailed,
                format!("{} must be an array of colours", path),
            )),
        },
        FieldKind::Url => match value {
            Value::String(s) => {
                let result = sanitizer::sanitize_url(s);
                if let Some(reason) = result.blocked {
                    out.blocked_urls.push(path.to_string());
                    out.errors.push(CheckFailure::new(
                        ErrorCode::SecurityBlocked,
                        format!("URL in {} blocked: {}", path, reason),
                    ));
                } else if result.was_modified {
                    out.warnings.push(format!("{} normalized", path));
                    *s = result.value;
                }
            }
            _ => out.errors.push(CheckFailure::new(
                ErrorCode::ValidationFailed,
                format!("{} must be a URL string", path),
            )),
        },
        FieldKind::Markup => match value {
            Value::String(s) => {
                let result = sanitizer::sanitize_html(s, HtmlOptions::permissive());
                if result.was_modified {
                    out.warnings.push(format!("{} sanitized: {}", path, result.issues.join(", ")));
                    *s = result.value;
                }
            }
            _ => out.errors.push(CheckFailure::new(
                ErrorCode::ValidationFailed,
                format!("{} must be a string", path),
            )),
        },
        // Plain text passes through; escaping belongs to whatever renders it.
        FieldKind::Text => {
            if !value.is_string() {
                out.errors.push(CheckFailure::new(
                    ErrorCode::ValidationFailed,
                    format!("{} must be a string", path),
                ));
            }
        }
        FieldKind::Numeric { min, max, integer } => {
            sanitize_numeric(value, path, min, max, integer, out)
        }
    }
}

fn sanitize_color(s: &mut String, path: &str, out: &mut Sanitized) {
    let result = sanitizer::sanitize_color_input(s);
    if result.value.is_empty() {
        out.errors.push(CheckFailure::new(
            ErrorCode::ValidationFailed,
            format!("{} contains no valid colour", path),
        ));
    } else if result.was_modified {
        out.warnings.push(format!("{} sanitized: {}", path, result.issues.join(", ")));
        *s = result.value;
    }
}

fn sanitize_color_tree(value: &mut Value, path: &str, out: &mut Sanitized) {
    match value {
        Value::String(s) => sanitize_color(s, path, out),
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                sanitize_color_tree(item, &format!("{}[{}]", path, i), out);
            }
        }
        Value::Object(map) => sanitize_object(map, path, out),
        _ => {}
    }
}

fn sanitize_numeric(value: &mut Value, path: &str, min: f64, max: f64, integer: bool, out: &mut Sanitized) {
    let (number, coerced) = match value {
        Value::Number(n) => (n.as_f64(), false),
        Value::String(s) => (s.trim().parse::<f64>().ok(), true),
        _ => (None, false),
    };

    let Some(number) = number.filter(|n| n.is_finite()) else {
        out.errors.push(CheckFailure::new(
            ErrorCode::ValidationFailed,
            format!("{} must be a number", path),
        ));
        return;
    };

    if integer && number.fract() != 0.0 {
        out.errors.push(CheckFailure::new(
            ErrorCode::ValidationFailed,
            format!("{} must be an integer", path),
        ));
        return;
    }
    if number < min || number > max {
        out.errors.push(CheckFailure::new(
            ErrorCode::ValidationFailed,
            format!("{} must be between {} and {}", path, min, max),
        ));
        return;
    }

    if coerced {
        let replacement = if integer {
            Some(Value::from(number as i64))
        } else {
            Number::from_f64(number).map(Value::Number)
        };
        if let Some(replacement) = replacement {
            out.warnings.push(format!("{} coerced to number", path));
            *value = replacement;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::clock::ManualClock;
    use crate::config::{AuditConfig, CacheSettings, RateLimitConfig, ResourceConfig};
    use crate::resources::{FixedMemory, MemoryProbe, PerformanceMonitor};
    use serde_json::json;

    struct Fixture {
        middleware: SecurityMiddleware,
        auditor: Arc<SecurityAuditor>,
        memory: Arc<FixedMemory>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(probe: Option<Arc<dyn MemoryProbe>>) -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let memory = Arc::new(FixedMemory::new(0));
        let probe = probe.unwrap_or_else(|| memory.clone() as Arc<dyn MemoryProbe>);
        let caches = Arc::new(CacheManager::new(CacheSettings::default(), clock.clone()));
        let resources = Arc::new(ResourceManager::new(
            ResourceConfig {
                memory_limit_bytes: 1_000,
                ..ResourceConfig::default()
            },
            Arc::new(PerformanceMonitor::new()),
            caches,
            probe,
        ));
        let auditor = Arc::new(SecurityAuditor::new(AuditConfig::default(), clock.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default(), clock.clone()));
        let middleware = SecurityMiddleware::new(
            SecurityConfig::default(),
            rate_limiter,
            resources,
            auditor.clone(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            middleware,
            auditor,
            memory,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn request(op: &str, params: Value) -> SecurityCheckRequest {
        SecurityCheckRequest::new(op, "caller", params)
    }

    #[derive(Debug)]
    struct PanickingProbe;

    impl MemoryProbe for PanickingProbe {
        fn resident_bytes(&self) -> u64 {
            panic!("probe failure")
        }
    }

    #[tokio::test]
    async fn test_clean_request_allowed() {
        let f = fixture();
        let result = f
            .middleware
            .check_security(&request(
                "convert_color",
                json!({"color": "#FF0000", "output_format": "hsl"}),
            ))
            .await;
        assert!(result.allowed, "{:?}", result.errors);
        assert!(result.errors.is_empty());
        assert_eq!(
            result.sanitized_parameters,
            Some(json!({"color": "#FF0000", "output_format": "hsl"}))
        );
        assert_eq!(result.rate_limit_info.map(|i| i.remaining_requests), Some(999));
    }

    #[tokio::test]
    async fn test_rate_limit_denial() {
        let f = fixture();
        let req = request("extract_palette_from_image", json!({"image_url": "https://example.com/a.png"}));
        for _ in 0..10 {
            assert!(f.middleware.check_security(&req).await.allowed);
        }
        let result = f.middleware.check_security(&req).await;
        assert!(!result.allowed);
        assert!(result.has_error(ErrorCode::RateLimitExceeded));
        assert!(result.rate_limit_info.and_then(|i| i.retry_after_ms).unwrap() > 0);
    }

    #[tokio::test]
    async fn test_rate_limited_caller_recovers_after_window() {
        let f = fixture();
        let req = request("extract_palette_from_image", json!({"image_url": "https://example.com/a.png"}));
        for _ in 0..10 {
            assert!(f.middleware.check_security(&req).await.allowed);
        }
        for _ in 0..20 {
            let result = f.middleware.check_security(&req).await;
            assert!(result.has_error(ErrorCode::RateLimitExceeded));
        }
        assert_eq!(f.auditor.client_risk_score("caller"), 100);

        f.clock.advance(60_001);
        let result = f.middleware.check_security(&req).await;
        assert!(result.allowed, "{:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.contains("risk score")));
    }

    #[tokio::test]
    async fn test_oversized_parameters_blocked_without_scan() {
        let f = fixture();
        let note = format!("<script>{}", "a".repeat(2 * 1024 * 1024));
        let result = f
            .middleware
            .check_security(&request("analyze_color", json!({"color": "red", "note": note})))
            .await;
        assert!(!result.allowed);
        assert!(result.has_error(ErrorCode::SecurityBlocked));
        assert!(result.errors[0].message.contains("parameters too large"));

        let metrics = f.auditor.metrics();
        assert!(!metrics.events_by_type.contains_key("input_validation"));
        assert_eq!(metrics.events_by_type["suspicious_activity"], 1);
    }

    #[tokio::test]
    async fn test_text_fields_kept_verbatim() {
        let f = fixture();
        let result = f
            .middleware
            .check_security(&request(
                "generate_contextual_palette",
                json!({"context": "autumn's <b>warm</b> tones", "title": "Q&A"}),
            ))
            .await;
        assert!(result.allowed, "{:?}", result.errors);
        let params = result.sanitized_parameters.unwrap();
        assert_eq!(params["context"], "autumn's <b>warm</b> tones");
        assert_eq!(params["title"], "Q&A");
        assert!(result.warnings.is_empty());

        let result = f
            .middleware
            .check_security(&request("generate_contextual_palette", json!({"context": 5})))
            .await;
        assert!(result.has_error(ErrorCode::ValidationFailed));
    }

    #[tokio::test]
    async fn test_aggressive_pressure_denies() {
        let f = fixture();
        f.memory.set(990);
        let result = f
            .middleware
            .check_security(&request("analyze_color", json!({"color": "red"})))
            .await;
        assert!(result.has_error(ErrorCode::ResourceExhausted));
        assert!(f.auditor.client_risk_score("caller") >= 20);
    }

    #[tokio::test]
    async fn test_historical_risk_blocks() {
        let f = fixture();
        for _ in 0..150 {
            f.auditor.log_security_event(NewSecurityEvent::new(
                EventType::SuspiciousActivity,
                Severity::High,
                "convert_color",
                "caller",
            ));
        }
        let result = f
            .middleware
            .check_security(&request(
                "convert_color",
                json!({"color": "<script>alert(1)</script>#FF0000", "output_format": "hex"}),
            ))
            .await;
        assert!(!result.allowed);
        assert!(result.has_error(ErrorCode::SecurityBlocked));
        assert!(result.errors[0].message.contains("blocked"));
    }

    #[tokio::test]
    async fn test_color_sanitized_with_warning() {
        let f = fixture();
        let result = f
            .middleware
            .check_security(&request(
                "convert_color",
                json!({"color": "<b>#00FF00</b>", "output_format": "rgb"}),
            ))
            .await;
        assert!(result.allowed, "{:?}", result.errors);
        assert_eq!(result.sanitized_parameters.unwrap()["color"], "#00FF00");
        assert!(result.warnings.iter().any(|w| w.starts_with("color sanitized")));
    }

    #[tokio::test]
    async fn test_nested_palette_sanitized() {
        let f = fixture();
        let result = f
            .middleware
            .check_security(&request(
                "create_color_comparison_png",
                json!({"color_sets": [["#000", "<i>#fff</i>"], ["red"]], "width": 100, "height": 100}),
            ))
            .await;
        assert!(result.allowed, "{:?}", result.errors);
        let params = result.sanitized_parameters.unwrap();
        assert_eq!(params["color_sets"][0][1], "#fff");
    }

    #[tokio::test]
    async fn test_blocked_url_is_hard_failure() {
        let f = fixture();
        let result = f
            .middleware
            .check_security(&request(
                "extract_palette_from_image",
                json!({"image_url": "http://169.254.169.254/latest/meta-data"}),
            ))
            .await;
        assert!(!result.allowed);
        assert!(result.has_error(ErrorCode::SecurityBlocked));
    }

    #[tokio::test]
    async fn test_numeric_rules() {
        let f = fixture();
        let coerced = f
            .middleware
            .check_security(&request(
                "generate_algorithmic_palette",
                json!({"base_color": "#123456", "count": "8"}),
            ))
            .await;
        assert!(coerced.allowed, "{:?}", coerced.errors);
        assert_eq!(coerced.sanitized_parameters.unwrap()["count"], 8);

        for bad in [json!("many"), json!(1.5), json!(0), json!(true)] {
            let result = f
                .middleware
                .check_security(&request(
                    "generate_algorithmic_palette",
                    json!({"base_color": "#123456", "count": bad}),
                ))
                .await;
            assert!(result.has_error(ErrorCode::ValidationFailed), "{:?}", result);
        }
    }

    #[tokio::test]
    async fn test_structural_limits() {
        let f = fixture();
        let too_big = f
            .middleware
            .check_security(&request(
                "create_gradient_png",
                json!({"colors": ["#000", "#fff"], "width": 5000, "height": 10}),
            ))
            .await;
        assert!(too_big.has_error(ErrorCode::ValidationFailed));

        let palette = f
            .middleware
            .check_security(&request(
                "generate_harmony_palette",
                json!({"base_color": "#000", "harmony_type": "triadic", "count": 60}),
            ))
            .await;
        assert!(palette.has_error(ErrorCode::ValidationFailed));

        let missing = f
            .middleware
            .check_security(&request("convert_color", json!({"color": "#000"})))
            .await;
        assert_eq!(missing.errors.len(), 1);
        assert!(missing.errors[0].message.contains("output_format"));
    }

    #[tokio::test]
    async fn test_non_object_parameters_rejected() {
        let f = fixture();
        let result = f
            .middleware
            .check_security(&request("analyze_color", json!(["#000"])))
            .await;
        assert!(result.has_error(ErrorCode::ValidationFailed));
    }

    #[tokio::test]
    async fn test_panic_fails_closed() {
        let f = fixture_with(Some(Arc::new(PanickingProbe)));
        let result = f
            .middleware
            .check_security(&request("analyze_color", json!({"color": "red"})))
            .await;
        assert!(!result.allowed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, ErrorCode::InternalError);
        assert_eq!(f.auditor.client_risk_score("caller"), 40);
    }

    #[tokio::test]
    async fn test_request_history_sweep() {
        let f = fixture();
        f.middleware
            .check_security(&request("analyze_color", json!({"color": "red"})))
            .await;
        assert_eq!(f.middleware.tracked_callers(), 1);
        assert_eq!(f.middleware.sweep(), 0);
    }
}
