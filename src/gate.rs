//! Process-wide governance context.
//!
//! # Responsibilities
//! - Own exactly one instance of every manager and wire them together
//! - Run checks and, for `execute`, the full tracked/cached tool call
//! - Start and stop every background task
//! - Apply reloaded configuration
//!
//! # Design Decisions
//! - Managers are shared as `Arc`s and injected, never global
//! - Only rate-limit rules change on reload; the other sections are read
//!   at construction

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::cache::CacheManager;
use crate::clock::{system_clock, SharedClock};
use crate::config::GateConfig;
use crate::error::{CheckFailure, ErrorCode, GateError, GateResult};
use crate::resources::{
    MemoryProbe, PerformanceMonitor, ProcStatmMemory, QualitySettings, ResourceManager,
};
use crate::security::{
    RateLimiter, SecurityAuditor, SecurityCheckRequest, SecurityCheckResult, SecurityMiddleware,
};

/// What a tool handler receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContext {
    pub operation: String,
    pub caller_id: String,
    /// Sanitized parameters.
    pub parameters: Value,
    pub quality: QualitySettings,
}

/// Business logic behind an operation.
pub trait ToolHandler: Send + Sync {
    fn handle<'a>(&'a self, context: &'a ToolContext) -> BoxFuture<'a, GateResult<Value>>;
}

/// Result of [`Gate::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub value: Value,
    pub cached: bool,
    pub warnings: Vec<String>,
    pub quality: QualitySettings,
}

/// Result cache used for an operation, if its output is cacheable.
pub fn cache_type_for(operation: &str) -> Option<&'static str> {
    match operation {
        "convert_color" => Some("color_conversion"),
        "analyze_color" => Some("color_analysis"),
        "generate_harmony_palette" | "generate_contextual_palette" | "generate_algorithmic_palette" => {
            Some("palette")
        }
        "create_palette_png" | "create_gradient_png" | "create_color_comparison_png"
        | "extract_palette_from_image" => Some("image"),
        "create_palette_html" => Some("html"),
        _ => None,
    }
}

pub struct Gate {
    config: ArcSwap<GateConfig>,
    clock: SharedClock,
    rate_limiter: Arc<RateLimiter>,
    caches: Arc<CacheManager>,
    monitor: Arc<PerformanceMonitor>,
    resources: Arc<ResourceManager>,
    auditor: Arc<SecurityAuditor>,
    middleware: Arc<SecurityMiddleware>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gate {
    /// Build with the system clock and the process memory probe.
    pub fn new(config: GateConfig) -> GateResult<Self> {
        Self::with_parts(config, system_clock(), Arc::new(ProcStatmMemory))
    }

    pub fn with_parts(
        config: GateConfig,
        clock: SharedClock,
        memory: Arc<dyn MemoryProbe>,
    ) -> GateResult<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit, clock.clone()));
        let caches = Arc::new(CacheManager::new(config.cache.clone(), clock.clone()));
        let monitor = Arc::new(PerformanceMonitor::new());
        let resources = Arc::new(ResourceManager::new(
            config.resources.clone(),
            monitor.clone(),
            caches.clone(),
            memory,
        ));
        let auditor = Arc::new(SecurityAuditor::new(config.audit.clone(), clock.clone()));
        let middleware = Arc::new(SecurityMiddleware::new(
            config.security.clone(),
            rate_limiter.clone(),
            resources.clone(),
            auditor.clone(),
            clock.clone(),
        )?);

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            clock,
            rate_limiter,
            caches,
            monitor,
            resources,
            auditor,
            middleware,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> Arc<GateConfig> {
        self.config.load_full()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn caches(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    pub fn middleware(&self) -> &Arc<SecurityMiddleware> {
        &self.middleware
    }

    pub async fn check_security(
        &self,
        operation: &str,
        caller_id: &str,
        parameters: Value,
    ) -> SecurityCheckResult {
        self.middleware
            .check_security(&SecurityCheckRequest::new(operation, caller_id, parameters))
            .await
    }

    /// Check, then run `handler` on the sanitized parameters.
    ///
    /// Cacheable operations are served from the result cache when the same
    /// parameters were seen at the same quality level.
    pub async fn execute(
        &self,
        operation: &str,
        caller_id: &str,
        parameters: Value,
        handler: &dyn ToolHandler,
    ) -> GateResult<ToolOutput> {
        let check = self.check_security(operation, caller_id, parameters).await;
        if !check.allowed {
            let failure = check.errors.into_iter().next().unwrap_or_else(|| {
                CheckFailure::new(ErrorCode::InternalError, "Denied without a reason")
            });
            return Err(GateError::Denied(failure));
        }

        let parameters = check.sanitized_parameters.unwrap_or(Value::Null);
        let quality = self.resources.quality_settings(operation);
        let mut guard = self.monitor.begin(operation);

        let cache_slot = cache_type_for(operation).map(|cache_type| {
            let key = self.caches.generate_key(
                cache_type,
                &json!({ "operation": operation, "parameters": parameters, "quality": quality }),
            );
            (cache_type, key)
        });

        if let Some((cache_type, key)) = &cache_slot {
            if let Some(value) = self.caches.get(cache_type, key) {
                self.monitor.record_cache_hit();
                guard.succeed();
                return Ok(ToolOutput {
                    value,
                    cached: true,
                    warnings: check.warnings,
                    quality,
                });
            }
            self.monitor.record_cache_miss();
        }

        let context = ToolContext {
            operation: operation.to_string(),
            caller_id: caller_id.to_string(),
            parameters,
            quality,
        };
        let value = handler.handle(&context).await.inspect_err(|e| {
            tracing::warn!(operation = %operation, caller_id = %caller_id, error = %e, "Tool handler failed");
        })?;

        if let Some((cache_type, key)) = cache_slot {
            if let Err(e) = self.caches.set(cache_type, key, value.clone()) {
                tracing::debug!(cache = cache_type, error = %e, "Result not cached");
            }
        }
        guard.succeed();

        Ok(ToolOutput {
            value,
            cached: false,
            warnings: check.warnings,
            quality,
        })
    }

    /// Swap in a reloaded configuration.
    pub fn apply_config(&self, config: GateConfig) {
        self.rate_limiter.apply_config(&config.rate_limit);
        self.config.store(Arc::new(config));
        tracing::info!("Configuration reloaded; rate limits applied, other sections take effect on restart");
    }

    /// Spawn every background task.
    pub fn start(&self) {
        self.caches.start();
        let handles = [
            self.rate_limiter.start(),
            self.auditor.start(),
            self.resources.start(),
            self.middleware.start(),
        ];
        let mut tasks = self.tasks.lock().expect("gate task mutex poisoned");
        tasks.extend(handles.into_iter().flatten());
        tracing::info!(tasks = tasks.len(), "Gate background tasks started");
    }

    /// Stop every background task and fail queued admissions.
    pub async fn destroy(&self) {
        self.resources.destroy();
        self.middleware.destroy();
        self.auditor.destroy();
        self.rate_limiter.destroy();
        self.caches.destroy();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("gate task mutex poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Gate stopped");
    }
}
