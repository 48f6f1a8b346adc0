//! Fixed-window rate limiting per operation and caller.
//!
//! # Responsibilities
//! - One counting window per (operation, caller) pair
//! - Per-operation rules with a conservative default for unknown operations
//! - Report remaining requests, reset time and retry-after to callers
//!
//! # Design Decisions
//! - Windows are replaced, never stretched, once they elapse
//! - A window keeps the rule it was created with; `update_limits` only affects
//!   windows started afterwards
//! - No internal retries; callers re-request after `retry_after_ms`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::SharedClock;
use crate::config::{RateLimitConfig, RateLimitRule};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// Counting window for one (operation, caller) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start: u64,
    pub count: u32,
    pub limit: u32,
    pub window_ms: u64,
}

impl RateWindow {
    fn fresh(rule: RateLimitRule, now: u64) -> Self {
        Self {
            window_start: now,
            count: 1,
            limit: rule.max_requests,
            window_ms: rule.window_ms,
        }
    }

    /// When the window closes.
    pub fn reset_time(&self) -> u64 {
        self.window_start.saturating_add(self.window_ms)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.reset_time()
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub remaining_requests: u32,
    pub reset_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Requests counted for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCount {
    pub operation: String,
    pub requests: u64,
}

/// Aggregate view of the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub total_entries: usize,
    pub active_windows: usize,
    pub top_operations: Vec<OperationCount>,
}

const TOP_OPERATIONS: usize = 10;

/// Per-operation, per-caller fixed-window limiter.
pub struct RateLimiter {
    enabled: AtomicBool,
    default_rule: RwLock<RateLimitRule>,
    rules: DashMap<String, RateLimitRule>,
    windows: DashMap<(String, String), RateWindow>,
    cleanup_interval_ms: u64,
    clock: SharedClock,
    shutdown: Shutdown,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Self {
        let rules = DashMap::new();
        for (operation, rule) in &config.operations {
            rules.insert(operation.clone(), *rule);
        }
        Self {
            enabled: AtomicBool::new(config.enabled),
            default_rule: RwLock::new(config.default_rule),
            rules,
            windows: DashMap::new(),
            cleanup_interval_ms: config.cleanup_interval_ms,
            clock,
            shutdown: Shutdown::new(),
        }
    }

    /// Rule that a new window for `operation` would use.
    pub fn rule_for(&self, operation: &str) -> RateLimitRule {
        self.rules
            .get(operation)
            .map(|r| *r.value())
            .unwrap_or_else(|| *self.default_rule.read().expect("rate limiter rule lock poisoned"))
    }

    /// Count one request against (operation, caller).
    ///
    /// `rule` overrides the configured rule for a newly started window.
    pub fn check_rate_limit(
        &self,
        operation: &str,
        caller_id: &str,
        rule: Option<RateLimitRule>,
    ) -> RateLimitInfo {
        let rule = rule.unwrap_or_else(|| self.rule_for(operation));
        let now = self.clock.now_ms();

        if !self.enabled.load(Ordering::Relaxed) {
            return RateLimitInfo {
                allowed: true,
                remaining_requests: rule.max_requests,
                reset_time_ms: now.saturating_add(rule.window_ms),
                retry_after_ms: None,
            };
        }

        let key = (operation.to_string(), caller_id.to_string());
        let info = match self.windows.entry(key) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let window = occupied.get_mut();
                window.count = window.count.saturating_add(1);
                if window.count <= window.limit {
                    RateLimitInfo {
                        allowed: true,
                        remaining_requests: window.limit - window.count,
                        reset_time_ms: window.reset_time(),
                        retry_after_ms: None,
                    }
                } else {
                    RateLimitInfo {
                        allowed: false,
                        remaining_requests: 0,
                        reset_time_ms: window.reset_time(),
                        retry_after_ms: Some(window.reset_time() - now),
                    }
                }
            }
            Entry::Occupied(mut occupied) => {
                let window = RateWindow::fresh(rule, now);
                occupied.insert(window);
                Self::fresh_info(&window)
            }
            Entry::Vacant(vacant) => {
                let window = RateWindow::fresh(rule, now);
                vacant.insert(window);
                Self::fresh_info(&window)
            }
        };

        if !info.allowed {
            tracing::warn!(
                operation = %operation,
                caller_id = %caller_id,
                retry_after_ms = ?info.retry_after_ms,
                "Rate limit exceeded"
            );
            metrics::record_rate_limited(operation);
        }
        info
    }

    fn fresh_info(window: &RateWindow) -> RateLimitInfo {
        RateLimitInfo {
            allowed: true,
            remaining_requests: window.limit.saturating_sub(window.count),
            reset_time_ms: window.reset_time(),
            retry_after_ms: None,
        }
    }

    /// Requests left in the current window without consuming one.
    pub fn remaining_requests(&self, operation: &str, caller_id: &str) -> u32 {
        let now = self.clock.now_ms();
        match self.active_window(operation, caller_id, now) {
            Some(window) => window.limit.saturating_sub(window.count),
            None => self.rule_for(operation).max_requests,
        }
    }

    /// End of the current window, or `None` without an active window.
    pub fn reset_time(&self, operation: &str, caller_id: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        self.active_window(operation, caller_id, now)
            .map(|w| w.reset_time())
    }

    fn active_window(&self, operation: &str, caller_id: &str, now: u64) -> Option<RateWindow> {
        self.windows
            .get(&(operation.to_string(), caller_id.to_string()))
            .map(|w| *w.value())
            .filter(|w| !w.is_expired(now))
    }

    /// Replace the rule for `operation`. Existing windows keep their rule.
    pub fn update_limits(&self, operation: &str, rule: RateLimitRule) {
        tracing::info!(
            operation = %operation,
            max_requests = rule.max_requests,
            window_ms = rule.window_ms,
            "Rate limit updated"
        );
        self.rules.insert(operation.to_string(), rule);
    }

    /// Swap in a reloaded configuration. Existing windows are kept.
    pub fn apply_config(&self, config: &RateLimitConfig) {
        self.enabled.store(config.enabled, Ordering::Relaxed);
        *self.default_rule.write().expect("rate limiter rule lock poisoned") = config.default_rule;
        self.rules
            .retain(|operation, _| config.operations.contains_key(operation));
        for (operation, rule) in &config.operations {
            self.rules.insert(operation.clone(), *rule);
        }
        tracing::info!(operations = config.operations.len(), "Rate limit configuration applied");
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now_ms();
        let mut per_operation: HashMap<String, u64> = HashMap::new();
        let mut active_windows = 0;
        for window in self.windows.iter() {
            if !window.value().is_expired(now) {
                active_windows += 1;
            }
            *per_operation.entry(window.key().0.clone()).or_default() += window.value().count as u64;
        }

        let mut top_operations: Vec<OperationCount> = per_operation
            .into_iter()
            .map(|(operation, requests)| OperationCount { operation, requests })
            .collect();
        top_operations.sort_by(|a, b| {
            b.requests
                .cmp(&a.requests)
                .then_with(|| a.operation.cmp(&b.operation))
        });
        top_operations.truncate(TOP_OPERATIONS);

        RateLimiterStats {
            total_entries: self.windows.len(),
            active_windows,
            top_operations,
        }
    }

    /// Clear windows matching the given operation and/or caller; both `None`
    /// clears everything.
    pub fn reset(&self, operation: Option<&str>, caller_id: Option<&str>) {
        match (operation, caller_id) {
            (None, None) => self.windows.clear(),
            _ => self.windows.retain(|(op, caller), _| {
                let op_match = operation.map_or(true, |o| o == op);
                let caller_match = caller_id.map_or(true, |c| c == caller);
                !(op_match && caller_match)
            }),
        }
    }

    /// Drop elapsed windows. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Spawn the periodic window sweep.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let mut shutdown = self.shutdown.subscribe();
        let limiter = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(limiter.cleanup_interval_ms));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired rate windows");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Rate window sweeper stopped");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (RateLimiter::new(&RateLimitConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_limit_then_deny() {
        let (limiter, _) = limiter();
        let rule = RateLimitRule { max_requests: 3, window_ms: 1_000 };
        for expected_remaining in [2, 1, 0] {
            let info = limiter.check_rate_limit("op", "c1", Some(rule));
            assert!(info.allowed);
            assert_eq!(info.remaining_requests, expected_remaining);
            assert_eq!(info.retry_after_ms, None);
        }
        let denied = limiter.check_rate_limit("op", "c1", Some(rule));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_requests, 0);
        assert_eq!(denied.retry_after_ms, Some(1_000));
    }

    #[test]
    fn test_retry_after_shrinks_within_window() {
        let (limiter, clock) = limiter();
        let rule = RateLimitRule { max_requests: 1, window_ms: 1_000 };
        limiter.check_rate_limit("op", "c1", Some(rule));
        clock.advance(400);
        let denied = limiter.check_rate_limit("op", "c1", Some(rule));
        assert_eq!(denied.retry_after_ms, Some(600));
        clock.advance(599);
        let denied = limiter.check_rate_limit("op", "c1", Some(rule));
        assert_eq!(denied.retry_after_ms, Some(1));
    }

    #[test]
    fn test_window_rollover_starts_fresh() {
        let (limiter, clock) = limiter();
        let rule = RateLimitRule { max_requests: 5, window_ms: 1_000 };
        for _ in 0..6 {
            limiter.check_rate_limit("op", "c1", Some(rule));
        }
        clock.advance(1_000);
        let info = limiter.check_rate_limit("op", "c1", Some(rule));
        assert!(info.allowed);
        assert_eq!(info.remaining_requests, 4);
        assert_eq!(info.reset_time_ms, 1_002_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = limiter();
        let rule = RateLimitRule { max_requests: 1, window_ms: 1_000 };
        assert!(limiter.check_rate_limit("op", "c1", Some(rule)).allowed);
        assert!(limiter.check_rate_limit("op", "c2", Some(rule)).allowed);
        assert!(limiter.check_rate_limit("other", "c1", Some(rule)).allowed);
        assert!(!limiter.check_rate_limit("op", "c1", Some(rule)).allowed);
    }

    #[test]
    fn test_unknown_operation_uses_default() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.rule_for("mystery"), RateLimitRule::per_minute(50));
        assert_eq!(limiter.remaining_requests("mystery", "c1"), 50);
        limiter.check_rate_limit("mystery", "c1", None);
        assert_eq!(limiter.remaining_requests("mystery", "c1"), 49);
    }

    #[test]
    fn test_update_limits_affects_new_windows_only() {
        let (limiter, clock) = limiter();
        limiter.check_rate_limit("convert_color", "c1", None);
        limiter.update_limits("convert_color", RateLimitRule { max_requests: 2, window_ms: 500 });

        // Current window still uses the 1000/min rule.
        assert_eq!(limiter.remaining_requests("convert_color", "c1"), 999);

        clock.advance(60_000);
        let info = limiter.check_rate_limit("convert_color", "c1", None);
        assert_eq!(info.remaining_requests, 1);
        assert_eq!(info.reset_time_ms, clock.now_ms() + 500);
    }

    #[test]
    fn test_reset_time_none_without_window() {
        let (limiter, clock) = limiter();
        assert_eq!(limiter.reset_time("op", "c1"), None);
        limiter.check_rate_limit("op", "c1", None);
        assert_eq!(limiter.reset_time("op", "c1"), Some(clock.now_ms() + 60_000));
        clock.advance(60_000);
        assert_eq!(limiter.reset_time("op", "c1"), None);
    }

    #[test]
    fn test_selective_reset() {
        let (limiter, _) = limiter();
        for (op, caller) in [("a", "x"), ("a", "y"), ("b", "x"), ("b", "y")] {
            limiter.check_rate_limit(op, caller, None);
        }
        limiter.reset(Some("a"), Some("x"));
        assert_eq!(limiter.stats().total_entries, 3);
        limiter.reset(None, Some("y"));
        assert_eq!(limiter.stats().total_entries, 1);
        limiter.reset(None, None);
        assert_eq!(limiter.stats().total_entries, 0);
    }

    #[test]
    fn test_stats_top_operations() {
        let (limiter, clock) = limiter();
        for _ in 0..3 {
            limiter.check_rate_limit("convert_color", "c1", None);
        }
        limiter.check_rate_limit("analyze_color", "c1", None);
        limiter.check_rate_limit("convert_color", "c2", None);

        let stats = limiter.stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.active_windows, 3);
        assert_eq!(stats.top_operations[0].operation, "convert_color");
        assert_eq!(stats.top_operations[0].requests, 4);

        clock.advance(60_000);
        assert_eq!(limiter.stats().active_windows, 0);
        assert_eq!(limiter.sweep_expired(), 3);
    }

    #[test]
    fn test_disabled_always_allows() {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(&config, clock);
        let rule = RateLimitRule { max_requests: 1, window_ms: 1_000 };
        for _ in 0..5 {
            assert!(limiter.check_rate_limit("op", "c1", Some(rule)).allowed);
        }
    }

    #[test]
    fn test_apply_config_replaces_rules() {
        let (limiter, _) = limiter();
        let mut config = RateLimitConfig::default();
        config.operations.clear();
        config
            .operations
            .insert("convert_color".to_string(), RateLimitRule::per_minute(3));
        config.default_rule = RateLimitRule::per_minute(7);
        limiter.apply_config(&config);

        assert_eq!(limiter.rule_for("convert_color").max_requests, 3);
        assert_eq!(limiter.rule_for("analyze_color").max_requests, 7);
    }
}
