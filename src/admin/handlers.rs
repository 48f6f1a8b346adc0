use std::collections::BTreeMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::cache::CacheStats;
use crate::resources::{DegradationLevel, HealthStatus, PerformanceStats, ResourceStatus};
use crate::security::{RateLimiterStats, SecurityMetrics, SecurityReport};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: HealthStatus,
    pub degradation_level: DegradationLevel,
    pub queue_length: usize,
    pub in_flight: usize,
    pub security_events: usize,
}

#[derive(Serialize)]
pub struct CacheSummary {
    pub total_size_bytes: u64,
    pub total_entries: usize,
    pub caches: BTreeMap<String, CacheStats>,
}

#[derive(Serialize)]
pub struct PerformanceSummary {
    pub performance: PerformanceStats,
    pub resources: ResourceStatus,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let gate = &state.gate;
    let resources = gate.resources().resource_status();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: resources.status,
        degradation_level: resources.strategy.level,
        queue_length: resources.queue_length,
        in_flight: resources.usage.concurrent_requests,
        security_events: gate.auditor().event_count(),
    })
}

pub async fn get_security_metrics(State(state): State<AdminState>) -> Json<SecurityMetrics> {
    Json(state.gate.auditor().metrics())
}

pub async fn get_security_report(State(state): State<AdminState>) -> Json<SecurityReport> {
    Json(state.gate.auditor().generate_security_report())
}

pub async fn get_rate_limits(State(state): State<AdminState>) -> Json<RateLimiterStats> {
    Json(state.gate.rate_limiter().stats())
}

pub async fn get_cache(State(state): State<AdminState>) -> Json<CacheSummary> {
    let caches = state.gate.caches();
    Json(CacheSummary {
        total_size_bytes: caches.total_size(),
        total_entries: caches.total_entries(),
        caches: caches.stats(),
    })
}

pub async fn get_performance(State(state): State<AdminState>) -> Json<PerformanceSummary> {
    Json(PerformanceSummary {
        performance: state.gate.monitor().stats(),
        resources: state.gate.resources().resource_status(),
    })
}
