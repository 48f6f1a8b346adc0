//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use tool_gate::clock::ManualClock;
use tool_gate::resources::FixedMemory;
use tool_gate::{Gate, GateConfig, GateResult, ToolContext, ToolHandler};

/// Memory limit used by [`test_config`]; pressure ratios map directly to bytes.
pub const MEMORY_LIMIT: u64 = 1_000;

pub const ADMIN_KEY: &str = "test-admin-key";

pub struct TestGate {
    pub gate: Arc<Gate>,
    pub clock: Arc<ManualClock>,
    pub memory: Arc<FixedMemory>,
}

impl TestGate {
    /// Set memory pressure as a fraction of the limit.
    pub fn set_pressure(&self, ratio: f64) {
        self.memory.set((MEMORY_LIMIT as f64 * ratio).round() as u64);
    }
}

pub fn test_config() -> GateConfig {
    let mut config = GateConfig::default();
    config.resources.memory_limit_bytes = MEMORY_LIMIT;
    config.admin.enabled = true;
    config.admin.api_key = ADMIN_KEY.to_string();
    config
}

pub fn test_gate() -> TestGate {
    test_gate_with(test_config())
}

pub fn test_gate_with(config: GateConfig) -> TestGate {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let memory = Arc::new(FixedMemory::new(0));
    let gate = Gate::with_parts(config, clock.clone(), memory.clone()).expect("gate builds");
    TestGate {
        gate: Arc::new(gate),
        clock,
        memory,
    }
}

/// Handler that returns its sanitized parameters and counts calls.
#[derive(Default)]
pub struct EchoHandler {
    pub calls: AtomicUsize,
}

impl EchoHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ToolHandler for EchoHandler {
    fn handle<'a>(&'a self, context: &'a ToolContext) -> BoxFuture<'a, GateResult<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(context.parameters.clone()) }.boxed()
    }
}
