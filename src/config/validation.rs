//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and cross-field
//! relationships. Validation is a pure function that returns every error,
//! not just the first.

use thiserror::Error;

use crate::config::schema::{CacheConfig, GateConfig, RateLimitRule};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a loaded configuration.
pub fn validate_config(config: &GateConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_rule("rate_limit.default_rule", &config.rate_limit.default_rule, &mut errors);
    for (name, rule) in &config.rate_limit.operations {
        check_rule(&format!("rate_limit.operations.{}", name), rule, &mut errors);
    }
    if config.rate_limit.cleanup_interval_ms == 0 {
        errors.push(ValidationError::new("rate_limit.cleanup_interval_ms", "must be > 0"));
    }

    check_cache("cache.defaults", &config.cache.defaults, &mut errors);
    for (name, cache) in &config.cache.types {
        check_cache(&format!("cache.types.{}", name), cache, &mut errors);
    }

    let res = &config.resources;
    if res.memory_limit_bytes == 0 {
        errors.push(ValidationError::new("resources.memory_limit_bytes", "must be > 0"));
    }
    if res.max_concurrent_requests == 0 {
        errors.push(ValidationError::new("resources.max_concurrent_requests", "must be > 0"));
    }
    if res.max_cache_bytes == 0 {
        errors.push(ValidationError::new("resources.max_cache_bytes", "must be > 0"));
    }
    if res.queue_poll_interval_ms == 0 {
        errors.push(ValidationError::new("resources.queue_poll_interval_ms", "must be > 0"));
    }
    if res.queue_timeout_ms < res.queue_poll_interval_ms {
        errors.push(ValidationError::new(
            "resources.queue_timeout_ms",
            "must be at least queue_poll_interval_ms",
        ));
    }
    if res.sample_interval_ms == 0 {
        errors.push(ValidationError::new("resources.sample_interval_ms", "must be > 0"));
    }

    let audit = &config.audit;
    if audit.max_events == 0 {
        errors.push(ValidationError::new("audit.max_events", "must be > 0"));
    }
    if audit.sweep_interval_ms == 0 {
        errors.push(ValidationError::new("audit.sweep_interval_ms", "must be > 0"));
    }
    if audit.retention_ms < 24 * 60 * 60 * 1000 {
        errors.push(ValidationError::new(
            "audit.retention_ms",
            "must cover at least the 24h reporting window",
        ));
    }

    let sec = &config.security;
    if sec.warn_parameter_bytes > sec.max_parameter_bytes {
        errors.push(ValidationError::new(
            "security.warn_parameter_bytes",
            "must not exceed max_parameter_bytes",
        ));
    }
    if sec.recent_request_warn > sec.recent_request_high {
        errors.push(ValidationError::new(
            "security.recent_request_warn",
            "must not exceed recent_request_high",
        ));
    }
    if sec.expensive_ops_warn > sec.expensive_ops_high {
        errors.push(ValidationError::new(
            "security.expensive_ops_warn",
            "must not exceed expensive_ops_high",
        ));
    }
    if sec.risk_score_warn > sec.risk_score_block || sec.risk_score_block > 100 {
        errors.push(ValidationError::new(
            "security.risk_score_block",
            "must be within [risk_score_warn, 100]",
        ));
    }
    if sec.recent_request_window_ms == 0 {
        errors.push(ValidationError::new("security.recent_request_window_ms", "must be > 0"));
    }
    if sec.expensive_window_ms == 0 {
        errors.push(ValidationError::new("security.expensive_window_ms", "must be > 0"));
    }
    if sec.max_image_dimension == 0 || sec.max_image_area == 0 || sec.max_palette_size == 0 {
        errors.push(ValidationError::new("security", "image and palette caps must be > 0"));
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must be set when admin is enabled"));
    }
    if config.admin.enabled && config.admin.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
    }
    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_rule(field: &str, rule: &RateLimitRule, errors: &mut Vec<ValidationError>) {
    if rule.max_requests == 0 {
        errors.push(ValidationError::new(format!("{}.max_requests", field), "must be > 0"));
    }
    if rule.window_ms == 0 {
        errors.push(ValidationError::new(format!("{}.window_ms", field), "must be > 0"));
    }
}

fn check_cache(field: &str, cache: &CacheConfig, errors: &mut Vec<ValidationError>) {
    if cache.max_entries == 0 {
        errors.push(ValidationError::new(format!("{}.max_entries", field), "must be > 0"));
    }
    if cache.max_size_bytes == 0 {
        errors.push(ValidationError::new(format!("{}.max_size_bytes", field), "must be > 0"));
    }
    if cache.ttl_ms == 0 {
        errors.push(ValidationError::new(format!("{}.ttl_ms", field), "must be > 0"));
    }
    if cache.cleanup_interval_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.cleanup_interval_ms", field),
            "must be > 0",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GateConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GateConfig::default();
        config.rate_limit.default_rule.max_requests = 0;
        config.resources.max_concurrent_requests = 0;
        config.audit.max_events = 0;
        config
            .cache
            .types
            .get_mut("image")
            .unwrap()
            .max_entries = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"rate_limit.default_rule.max_requests"));
        assert!(fields.contains(&"resources.max_concurrent_requests"));
        assert!(fields.contains(&"audit.max_events"));
        assert!(fields.contains(&"cache.types.image.max_entries"));
    }

    #[test]
    fn test_request_windows_must_be_positive() {
        let mut config = GateConfig::default();
        config.security.recent_request_window_ms = 0;
        config.security.expensive_window_ms = 0;
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["security.recent_request_window_ms", "security.expensive_window_ms"]
        );
    }

    #[test]
    fn test_admin_requires_key() {
        let mut config = GateConfig::default();
        config.admin.enabled = true;
        config.admin.api_key = "  ".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "admin.api_key: must be set when admin is enabled");
    }
}
