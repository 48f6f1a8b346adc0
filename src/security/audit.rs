//! Security event log and per-caller risk scoring.
//!
//! # Data Flow
//! ```text
//! log_security_event(event)
//!     → record: timestamp, append, score += weight(severity, type), trim
//!     → evaluate_threats (organic events only)
//!         → match: append synthetic critical suspicious_activity, score += 50
//! ```
//!
//! # Design Decisions
//! - The event log and the score table share one lock so a reset or sweep
//!   never observes one without the other
//! - Scores are only ever added to at append time; they are never rebuilt
//!   from the log
//! - Synthetic escalation events bypass `evaluate_threats`, so escalation
//!   cannot feed itself
//! - Throttling events (`rate_limit`, `access_denied`) raise the risk score
//!   but not the block score; being throttled alone never leads to a block

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::AuditConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const MAX_RISK_SCORE: u8 = 100;
const ESCALATION_BONUS: u8 = 50;
const TOP_CLIENTS: usize = 10;
const RECENT_CRITICAL: usize = 10;

/// Category of a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InputValidation,
    RateLimit,
    ResourceAbuse,
    SuspiciousActivity,
    AccessDenied,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InputValidation => "input_validation",
            EventType::RateLimit => "rate_limit",
            EventType::ResourceAbuse => "resource_abuse",
            EventType::SuspiciousActivity => "suspicious_activity",
            EventType::AccessDenied => "access_denied",
        }
    }
}

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Base risk added for one event of this severity.
    pub fn weight(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 5,
            Severity::High => 20,
            Severity::Critical => 50,
        }
    }
}

/// Risk added to the caller's score by one event.
pub fn risk_weight(event_type: EventType, severity: Severity) -> u8 {
    let base = severity.weight();
    if event_type == EventType::SuspiciousActivity {
        base.saturating_mul(2)
    } else {
        base
    }
}

/// Events the gate emits when it throttles a caller rather than catches one.
pub fn is_throttle_event(event_type: EventType) -> bool {
    matches!(event_type, EventType::RateLimit | EventType::AccessDenied)
}

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub operation: String,
    pub caller_id: String,
    pub details: Map<String, Value>,
    pub timestamp: u64,
}

/// Event submitted for logging; the auditor assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSecurityEvent {
    pub event_type: EventType,
    pub severity: Severity,
    pub operation: String,
    pub caller_id: String,
    pub details: Map<String, Value>,
}

impl NewSecurityEvent {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        operation: impl Into<String>,
        caller_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            severity,
            operation: operation.into(),
            caller_id: caller_id.into(),
            details: Map::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Result of [`SecurityAuditor::analyze_input`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAnalysis {
    pub is_suspicious: bool,
    pub suspicious_patterns: Vec<String>,
    pub risk_score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRisk {
    pub caller_id: String,
    pub risk_score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientActivity {
    pub caller_id: String,
    pub events: usize,
}

/// Aggregates over the last 24 hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    pub total_events: usize,
    pub events_last_24h: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub events_by_severity: BTreeMap<String, usize>,
    pub top_risk_clients: Vec<ClientRisk>,
    pub top_active_clients: Vec<ClientActivity>,
    pub tracked_clients: usize,
}

/// Change versus the preceding 24 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityTrends {
    pub total_events_delta: i64,
    pub critical_events_delta: i64,
    pub high_events_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub generated_at: u64,
    pub period_ms: u64,
    pub metrics: SecurityMetrics,
    pub trends: SecurityTrends,
    pub recent_critical_events: Vec<SecurityEvent>,
    pub recommendations: Vec<String>,
}

struct InputPattern {
    name: &'static str,
    regex: Regex,
    weight: u8,
}

static INPUT_PATTERNS: LazyLock<Vec<InputPattern>> = LazyLock::new(|| {
    [
        ("script_tag", r"(?i)<\s*/?\s*script\b", 40),
        ("javascript_scheme", r"(?i)javascript\s*:", 30),
        ("vbscript_scheme", r"(?i)vbscript\s*:", 30),
        ("event_handler", r"(?i)\bon[a-z]+\s*=", 25),
        ("eval_call", r"(?i)\beval\s*\(", 30),
        ("css_expression", r"(?i)\bexpression\s*\(", 25),
        ("embedded_object", r"(?i)<\s*(iframe|object|embed)\b", 35),
    ]
    .into_iter()
    .map(|(name, pattern, weight)| InputPattern {
        name,
        regex: Regex::new(pattern).expect("valid regex"),
        weight,
    })
    .collect()
});

const EXCESSIVE_LENGTH_WEIGHT: u8 = 20;
const NON_PRINTABLE_WEIGHT: u8 = 25;
const REPEATED_CONTENT_WEIGHT: u8 = 15;
const NON_PRINTABLE_RATIO: f64 = 0.1;
const MIN_REPEAT_CHUNK: usize = 10;
const MAX_REPEAT_CHUNK: usize = 200;
const MIN_REPEATS: usize = 10;

/// Logged severity for an input-analysis score.
pub fn severity_for_input_score(score: u8) -> Severity {
    match score {
        80.. => Severity::Critical,
        50..=79 => Severity::High,
        25..=49 => Severity::Medium,
        _ => Severity::Low,
    }
}

fn non_printable_ratio(chars: &[char]) -> f64 {
    if chars.is_empty() {
        return 0.0;
    }
    let count = chars
        .iter()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        .count();
    count as f64 / chars.len() as f64
}

/// True when some chunk of at least 10 chars appears 10+ times back to back.
fn has_repeated_chunk(chars: &[char]) -> bool {
    let max_chunk = (chars.len() / MIN_REPEATS).min(MAX_REPEAT_CHUNK);
    for chunk in MIN_REPEAT_CHUNK..=max_chunk {
        let needed = chunk * (MIN_REPEATS - 1);
        let mut run = 0;
        for j in 0..chars.len() - chunk {
            if chars[j] == chars[j + chunk] {
                run += 1;
                if run >= needed {
                    return true;
                }
            } else {
                run = 0;
            }
        }
    }
    false
}

struct AuditState {
    events: VecDeque<SecurityEvent>,
    risk_scores: HashMap<String, u8>,
    /// Risk from non-throttle events only.
    block_scores: HashMap<String, u8>,
}

fn add_capped(scores: &mut HashMap<String, u8>, caller_id: &str, amount: u8) {
    let score = scores.entry(caller_id.to_string()).or_insert(0);
    *score = score.saturating_add(amount).min(MAX_RISK_SCORE);
}

impl AuditState {
    fn add_risk(&mut self, caller_id: &str, amount: u8, blocking: bool) {
        add_capped(&mut self.risk_scores, caller_id, amount);
        if blocking {
            add_capped(&mut self.block_scores, caller_id, amount);
        }
    }

    fn count_since(&self, caller_id: &str, since: u64) -> usize {
        self.events
            .iter()
            .rev()
            .take_while(|e| e.timestamp >= since)
            .filter(|e| e.caller_id == caller_id)
            .count()
    }
}

/// Append-only security log with risk scores and threat escalation.
pub struct SecurityAuditor {
    config: AuditConfig,
    clock: SharedClock,
    state: Mutex<AuditState>,
    shutdown: Shutdown,
}

impl SecurityAuditor {
    pub fn new(config: AuditConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(AuditState {
                events: VecDeque::new(),
                risk_scores: HashMap::new(),
                block_scores: HashMap::new(),
            }),
            shutdown: Shutdown::new(),
        }
    }

    /// Record an event and run the escalation check once.
    pub fn log_security_event(&self, event: NewSecurityEvent) -> SecurityEvent {
        let (recorded, escalation) = {
            let mut state = self.state.lock().expect("audit state mutex poisoned");
            let recorded = self.record(&mut state, event);
            let escalation = self
                .evaluate_threats(&state, &recorded)
                .map(|trigger| self.append_escalation(&mut state, &recorded, trigger));
            (recorded, escalation)
        };

        self.emit(&recorded);
        if let Some(synthetic) = escalation {
            self.emit(&synthetic);
        }
        recorded
    }

    fn record(&self, state: &mut AuditState, event: NewSecurityEvent) -> SecurityEvent {
        let recorded = SecurityEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            severity: event.severity,
            operation: event.operation,
            caller_id: event.caller_id,
            details: event.details,
            timestamp: self.clock.now_ms(),
        };
        state.add_risk(
            &recorded.caller_id,
            risk_weight(recorded.event_type, recorded.severity),
            !is_throttle_event(recorded.event_type),
        );
        state.events.push_back(recorded.clone());
        self.trim(state);
        recorded
    }

    /// Name of the heuristic that `event` trips, if any.
    fn evaluate_threats(&self, state: &AuditState, event: &SecurityEvent) -> Option<&'static str> {
        match (event.event_type, event.severity) {
            (EventType::InputValidation, Severity::Critical) => {
                return Some("critical_input_validation")
            }
            (EventType::ResourceAbuse, Severity::High | Severity::Critical) => {
                return Some("resource_abuse")
            }
            _ => {}
        }

        let since = event
            .timestamp
            .saturating_sub(self.config.escalation_window_ms);
        if state.count_since(&event.caller_id, since) > self.config.escalation_event_threshold {
            return Some("event_burst");
        }
        None
    }

    fn append_escalation(
        &self,
        state: &mut AuditState,
        trigger_event: &SecurityEvent,
        trigger: &'static str,
    ) -> SecurityEvent {
        let mut details = Map::new();
        details.insert("trigger".into(), Value::from(trigger));
        details.insert("trigger_event_id".into(), Value::from(trigger_event.id.to_string()));
        details.insert(
            "trigger_event_type".into(),
            Value::from(trigger_event.event_type.as_str()),
        );

        let synthetic = SecurityEvent {
            id: Uuid::new_v4(),
            event_type: EventType::SuspiciousActivity,
            severity: Severity::Critical,
            operation: trigger_event.operation.clone(),
            caller_id: trigger_event.caller_id.clone(),
            details,
            timestamp: trigger_event.timestamp,
        };
        state.add_risk(
            &synthetic.caller_id,
            ESCALATION_BONUS,
            !is_throttle_event(trigger_event.event_type),
        );
        state.events.push_back(synthetic.clone());
        self.trim(state);
        synthetic
    }

    fn trim(&self, state: &mut AuditState) {
        while state.events.len() > self.config.max_events {
            state.events.pop_front();
        }
    }

    fn emit(&self, event: &SecurityEvent) {
        metrics::record_security_event(event.event_type.as_str(), event.severity.as_str());
        match event.severity {
            Severity::Critical | Severity::High => tracing::warn!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                operation = %event.operation,
                caller_id = %event.caller_id,
                "Security event"
            ),
            Severity::Medium | Severity::Low => tracing::info!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                operation = %event.operation,
                caller_id = %event.caller_id,
                "Security event"
            ),
        }
    }

    /// Scan `input` for injection patterns and anomalies.
    ///
    /// Logs an `input_validation` event when anything is found.
    pub fn analyze_input(&self, input: &str, operation: &str, caller_id: &str) -> InputAnalysis {
        let mut patterns = Vec::new();
        let mut score: u8 = 0;

        for pattern in INPUT_PATTERNS.iter() {
            if pattern.regex.is_match(input) {
                patterns.push(pattern.name.to_string());
                score = score.saturating_add(pattern.weight);
            }
        }

        let chars: Vec<char> = input.chars().collect();
        if chars.len() > self.config.max_input_length {
            patterns.push("excessive_length".to_string());
            score = score.saturating_add(EXCESSIVE_LENGTH_WEIGHT);
        }
        if non_printable_ratio(&chars) > NON_PRINTABLE_RATIO {
            patterns.push("non_printable_characters".to_string());
            score = score.saturating_add(NON_PRINTABLE_WEIGHT);
        }
        if has_repeated_chunk(&chars) {
            patterns.push("repeated_content".to_string());
            score = score.saturating_add(REPEATED_CONTENT_WEIGHT);
        }

        let analysis = InputAnalysis {
            is_suspicious: !patterns.is_empty(),
            suspicious_patterns: patterns,
            risk_score: score.min(MAX_RISK_SCORE),
        };

        if analysis.is_suspicious {
            self.log_security_event(
                NewSecurityEvent::new(
                    EventType::InputValidation,
                    severity_for_input_score(analysis.risk_score),
                    operation,
                    caller_id,
                )
                .detail("patterns", analysis.suspicious_patterns.clone())
                .detail("risk_score", analysis.risk_score)
                .detail("input_length", chars.len()),
            );
        }
        analysis
    }

    /// Events from `caller_id` within the last `window_ms`.
    pub fn client_event_count(&self, caller_id: &str, window_ms: u64) -> usize {
        let since = self.clock.now_ms().saturating_sub(window_ms);
        self.state
            .lock()
            .expect("audit state mutex poisoned")
            .count_since(caller_id, since)
    }

    pub fn client_risk_score(&self, caller_id: &str) -> u8 {
        self.state
            .lock()
            .expect("audit state mutex poisoned")
            .risk_scores
            .get(caller_id)
            .copied()
            .unwrap_or(0)
    }

    /// Risk score counting only events that are not throttling responses.
    ///
    /// This is the score that decides whether a caller gets blocked.
    pub fn client_block_score(&self, caller_id: &str) -> u8 {
        self.state
            .lock()
            .expect("audit state mutex poisoned")
            .block_scores
            .get(caller_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of events currently held.
    pub fn event_count(&self) -> usize {
        self.state.lock().expect("audit state mutex poisoned").events.len()
    }

    /// Most recent `limit` events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        let state = self.state.lock().expect("audit state mutex poisoned");
        let skip = state.events.len().saturating_sub(limit);
        state.events.iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> SecurityMetrics {
        let now = self.clock.now_ms();
        let state = self.state.lock().expect("audit state mutex poisoned");
        Self::collect_metrics(&state, now)
    }

    fn collect_metrics(state: &AuditState, now: u64) -> SecurityMetrics {
        let since = now.saturating_sub(DAY_MS);
        let mut events_by_type = BTreeMap::new();
        let mut events_by_severity = BTreeMap::new();
        let mut per_client: HashMap<&str, usize> = HashMap::new();
        let mut events_last_24h = 0;

        for event in state.events.iter().filter(|e| e.timestamp >= since) {
            events_last_24h += 1;
            *events_by_type
                .entry(event.event_type.as_str().to_string())
                .or_insert(0) += 1;
            *events_by_severity
                .entry(event.severity.as_str().to_string())
                .or_insert(0) += 1;
            *per_client.entry(event.caller_id.as_str()).or_insert(0) += 1;
        }

        let mut top_risk_clients: Vec<ClientRisk> = state
            .risk_scores
            .iter()
            .map(|(caller_id, score)| ClientRisk {
                caller_id: caller_id.clone(),
                risk_score: *score,
            })
            .collect();
        top_risk_clients.sort_by(|a, b| {
            b.risk_score
                .cmp(&a.risk_score)
                .then_with(|| a.caller_id.cmp(&b.caller_id))
        });
        top_risk_clients.truncate(TOP_CLIENTS);

        let mut top_active_clients: Vec<ClientActivity> = per_client
            .into_iter()
            .map(|(caller_id, events)| ClientActivity {
                caller_id: caller_id.to_string(),
                events,
            })
            .collect();
        top_active_clients.sort_by(|a, b| {
            b.events
                .cmp(&a.events)
                .then_with(|| a.caller_id.cmp(&b.caller_id))
        });
        top_active_clients.truncate(TOP_CLIENTS);

        SecurityMetrics {
            total_events: state.events.len(),
            events_last_24h,
            events_by_type,
            events_by_severity,
            top_risk_clients,
            top_active_clients,
            tracked_clients: state.risk_scores.len(),
        }
    }

    /// 24-hour report with trend deltas and recommendations.
    pub fn generate_security_report(&self) -> SecurityReport {
        let now = self.clock.now_ms();
        let state = self.state.lock().expect("audit state mutex poisoned");
        let metrics = Self::collect_metrics(&state, now);

        let current_start = now.saturating_sub(DAY_MS);
        let previous_start = now.saturating_sub(2 * DAY_MS);
        let count = |from: u64, to: u64, severity: Option<Severity>| -> i64 {
            state
                .events
                .iter()
                .filter(|e| e.timestamp >= from && e.timestamp < to)
                .filter(|e| severity.map_or(true, |s| e.severity == s))
                .count() as i64
        };
        let delta = |severity: Option<Severity>| {
            count(current_start, u64::MAX, severity) - count(previous_start, current_start, severity)
        };
        let trends = SecurityTrends {
            total_events_delta: delta(None),
            critical_events_delta: delta(Some(Severity::Critical)),
            high_events_delta: delta(Some(Severity::High)),
        };

        let mut recent_critical_events: Vec<SecurityEvent> = state
            .events
            .iter()
            .rev()
            .filter(|e| e.timestamp >= current_start && e.severity == Severity::Critical)
            .take(RECENT_CRITICAL)
            .cloned()
            .collect();
        recent_critical_events.reverse();
        drop(state);

        let recommendations = recommendations(&metrics, &trends);
        SecurityReport {
            generated_at: now,
            period_ms: DAY_MS,
            metrics,
            trends,
            recent_critical_events,
            recommendations,
        }
    }

    /// Drop events past retention and scores of callers with no events left.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(self.config.retention_ms);
        let mut state = self.state.lock().expect("audit state mutex poisoned");
        let before = state.events.len();
        while state.events.front().is_some_and(|e| e.timestamp < cutoff) {
            state.events.pop_front();
        }
        let removed = before - state.events.len();

        let AuditState {
            events,
            risk_scores,
            block_scores,
        } = &mut *state;
        risk_scores.retain(|caller_id, _| events.iter().any(|e| &e.caller_id == caller_id));
        block_scores.retain(|caller_id, _| risk_scores.contains_key(caller_id));
        removed
    }

    /// Clear the log and every score.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("audit state mutex poisoned");
        state.events.clear();
        state.risk_scores.clear();
        state.block_scores.clear();
        tracing::info!("Security audit state reset");
    }

    /// Spawn the periodic retention sweep.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.shutdown.is_triggered() {
            return None;
        }
        let mut shutdown = self.shutdown.subscribe();
        let auditor = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(auditor.config.sweep_interval_ms));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = auditor.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired security events");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Security audit sweeper stopped");
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

fn recommendations(metrics: &SecurityMetrics, trends: &SecurityTrends) -> Vec<String> {
    let by_type = |t: EventType| metrics.events_by_type.get(t.as_str()).copied().unwrap_or(0);
    let critical = metrics
        .events_by_severity
        .get(Severity::Critical.as_str())
        .copied()
        .unwrap_or(0);
    let high_risk = metrics
        .top_risk_clients
        .iter()
        .filter(|c| c.risk_score >= 80)
        .count();

    let mut out = Vec::new();
    if critical > 0 {
        out.push(format!(
            "Investigate {} critical security events from the last 24 hours",
            critical
        ));
    }
    if high_risk > 0 {
        out.push(format!(
            "Review or block {} clients with risk score 80 or higher",
            high_risk
        ));
    }
    if by_type(EventType::RateLimit) > 100 {
        out.push("Frequent rate-limit violations; consider tightening per-operation limits".to_string());
    }
    if by_type(EventType::InputValidation) > 50 {
        out.push("High volume of malicious input; review upstream input sources".to_string());
    }
    if by_type(EventType::ResourceAbuse) > 0 {
        out.push("Resource exhaustion observed; review capacity and expensive-operation limits".to_string());
    }
    if trends.total_events_delta > 0 && metrics.events_last_24h > 0 {
        let previous = metrics.events_last_24h as i64 - trends.total_events_delta;
        if previous > 0 && trends.total_events_delta >= previous {
            out.push("Security event volume at least doubled versus the previous day".to_string());
        }
    }
    if out.is_empty() {
        out.push("No immediate action required".to_string());
    }
    out
}
