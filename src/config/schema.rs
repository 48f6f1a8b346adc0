//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gate.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the governance gate.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GateConfig {
    /// Per-operation rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Bounded cache instances.
    pub cache: CacheSettings,

    /// Resource limits and admission control.
    pub resources: ResourceConfig,

    /// Security audit log settings.
    pub audit: AuditConfig,

    /// Request inspection thresholds.
    pub security: SecurityConfig,

    /// Admin HTTP surface.
    pub admin: AdminConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// A fixed-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitRule {
    /// Requests allowed per window.
    pub max_requests: u32,

    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimitRule {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_ms: 60_000,
        }
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::per_minute(50)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Rule for operations without an explicit entry.
    pub default_rule: RateLimitRule,

    /// Operation name -> rule.
    pub operations: BTreeMap<String, RateLimitRule>,

    /// How often expired windows are dropped, in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rule: RateLimitRule::default(),
            operations: default_operation_limits(),
            cleanup_interval_ms: 60_000,
        }
    }
}

fn default_operation_limits() -> BTreeMap<String, RateLimitRule> {
    [
        ("convert_color", 1000),
        ("analyze_color", 500),
        ("generate_harmony_palette", 100),
        ("generate_contextual_palette", 100),
        ("generate_algorithmic_palette", 100),
        ("create_palette_html", 50),
        ("create_palette_png", 20),
        ("create_gradient_png", 20),
        ("create_color_comparison_png", 15),
        ("extract_palette_from_image", 10),
    ]
    .into_iter()
    .map(|(name, max)| (name.to_string(), RateLimitRule::per_minute(max)))
    .collect()
}

/// Settings for a single bounded cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total estimated size budget in bytes.
    pub max_size_bytes: u64,

    /// Entry count budget.
    pub max_entries: usize,

    /// Time to live per entry in milliseconds.
    pub ttl_ms: u64,

    /// Interval of the expiry sweep in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024, // 10MB
            max_entries: 1000,
            ttl_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }
}

/// Cache instances by logical type.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Used for any type requested at runtime without an entry below.
    pub defaults: CacheConfig,

    /// Cache type name -> settings.
    pub types: BTreeMap<String, CacheConfig>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let mut types = BTreeMap::new();
        types.insert(
            "color_conversion".to_string(),
            CacheConfig {
                max_size_bytes: 5 * 1024 * 1024,
                max_entries: 5000,
                ..CacheConfig::default()
            },
        );
        types.insert(
            "color_analysis".to_string(),
            CacheConfig {
                max_size_bytes: 5 * 1024 * 1024,
                max_entries: 2000,
                ..CacheConfig::default()
            },
        );
        types.insert("palette".to_string(), CacheConfig::default());
        types.insert(
            "image".to_string(),
            CacheConfig {
                max_size_bytes: 50 * 1024 * 1024,
                max_entries: 100,
                ttl_ms: 30 * 60 * 1000,
                ..CacheConfig::default()
            },
        );
        types.insert(
            "html".to_string(),
            CacheConfig {
                max_entries: 200,
                ttl_ms: 30 * 60 * 1000,
                ..CacheConfig::default()
            },
        );
        Self {
            defaults: CacheConfig::default(),
            types,
        }
    }
}

/// Resource limits and admission control.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Process memory considered 100% pressure.
    pub memory_limit_bytes: u64,

    /// In-flight operations considered 100% pressure.
    pub max_concurrent_requests: usize,

    /// Aggregate cache size considered 100% pressure.
    pub max_cache_bytes: u64,

    /// Added delay under light degradation.
    pub throttle_delay_ms: u64,

    /// Maximum wait in the admission queue.
    pub queue_timeout_ms: u64,

    /// How often a queued admission re-checks pressure.
    pub queue_poll_interval_ms: u64,

    /// Admission queue length kept by `cleanup()`.
    pub max_queue_size: usize,

    /// Background usage sampling interval.
    pub sample_interval_ms: u64,

    /// Operations disabled under aggressive degradation.
    pub expensive_operations: Vec<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 512 * 1024 * 1024, // 512MB
            max_concurrent_requests: 50,
            max_cache_bytes: 100 * 1024 * 1024, // 100MB
            throttle_delay_ms: 100,
            queue_timeout_ms: 30_000,
            queue_poll_interval_ms: 100,
            max_queue_size: 100,
            sample_interval_ms: 5_000,
            expensive_operations: vec![
                "create_palette_png".to_string(),
                "create_gradient_png".to_string(),
                "create_color_comparison_png".to_string(),
                "extract_palette_from_image".to_string(),
            ],
        }
    }
}

/// Security audit log settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Events kept in memory; oldest are trimmed first.
    pub max_events: usize,

    /// Events older than this are dropped by the sweep.
    pub retention_ms: u64,

    /// Retention sweep interval.
    pub sweep_interval_ms: u64,

    /// Window for the event-burst escalation heuristic.
    pub escalation_window_ms: u64,

    /// Events within the window above which a caller is escalated.
    pub escalation_event_threshold: usize,

    /// Inputs longer than this are flagged.
    pub max_input_length: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            retention_ms: 7 * 24 * 60 * 60 * 1000,
            sweep_interval_ms: 60 * 60 * 1000,
            escalation_window_ms: 60_000,
            escalation_event_threshold: 100,
            max_input_length: 10_000,
        }
    }
}

/// Request inspection thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enable security headers on the admin surface.
    pub enable_headers: bool,

    /// Raw parameter size treated as high severity.
    pub max_parameter_bytes: usize,

    /// Raw parameter size that only warns.
    pub warn_parameter_bytes: usize,

    /// Largest width or height of a generated image.
    pub max_image_dimension: u64,

    /// Largest width * height of a generated image.
    pub max_image_area: u64,

    /// Largest palette a generative operation may request.
    pub max_palette_size: u64,

    /// Window for the per-caller request counter.
    pub recent_request_window_ms: u64,

    /// Requests per window that warn.
    pub recent_request_warn: usize,

    /// Requests per window treated as high severity.
    pub recent_request_high: usize,

    /// Window for the expensive-operation counter.
    pub expensive_window_ms: u64,

    /// Expensive operations per window that warn.
    pub expensive_ops_warn: usize,

    /// Expensive operations per window treated as high severity.
    pub expensive_ops_high: usize,

    /// Historical risk score that blocks outright.
    pub risk_score_block: u8,

    /// Historical risk score that warns.
    pub risk_score_warn: u8,

    /// 24h event count that warns.
    pub daily_events_warn: usize,

    /// 24h event count treated as high severity.
    pub daily_events_high: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_headers: true,
            max_parameter_bytes: 2 * 1024 * 1024, // 2MB
            warn_parameter_bytes: 256 * 1024,
            max_image_dimension: 4096,
            max_image_area: 4096 * 4096,
            max_palette_size: 50,
            recent_request_window_ms: 60_000,
            recent_request_warn: 60,
            recent_request_high: 120,
            expensive_window_ms: 5 * 60 * 1000,
            expensive_ops_warn: 10,
            expensive_ops_high: 20,
            risk_score_block: 80,
            risk_score_warn: 50,
            daily_events_warn: 50,
            daily_events_high: 100,
        }
    }
}

/// Admin HTTP surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin surface.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Bind address.
    pub bind_address: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty for development, JSON for production.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
