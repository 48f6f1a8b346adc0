//! Degradation levels and the output quality they allow.

use serde::{Deserialize, Serialize};

use crate::config::ResourceConfig;

/// Pressure ratio at which each level starts.
pub const LIGHT_THRESHOLD: f64 = 0.6;
pub const MODERATE_THRESHOLD: f64 = 0.75;
pub const AGGRESSIVE_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    None,
    Light,
    Moderate,
    Aggressive,
}

impl DegradationLevel {
    pub fn from_pressure(pressure: f64) -> Self {
        if pressure >= AGGRESSIVE_THRESHOLD {
            DegradationLevel::Aggressive
        } else if pressure >= MODERATE_THRESHOLD {
            DegradationLevel::Moderate
        } else if pressure >= LIGHT_THRESHOLD {
            DegradationLevel::Light
        } else {
            DegradationLevel::None
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::None => "none",
            DegradationLevel::Light => "light",
            DegradationLevel::Moderate => "moderate",
            DegradationLevel::Aggressive => "aggressive",
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DegradationLevel::None,
            1 => DegradationLevel::Light,
            2 => DegradationLevel::Moderate,
            _ => DegradationLevel::Aggressive,
        }
    }

    fn one_step_worse(self) -> Self {
        match self {
            DegradationLevel::None => DegradationLevel::None,
            DegradationLevel::Light => DegradationLevel::Moderate,
            DegradationLevel::Moderate | DegradationLevel::Aggressive => DegradationLevel::Aggressive,
        }
    }

    /// Mitigations in the order they are applied.
    pub fn actions(&self) -> Vec<DegradationAction> {
        use DegradationAction::*;
        match self {
            DegradationLevel::None => vec![],
            DegradationLevel::Light => vec![Throttle, OpportunisticCleanup],
            DegradationLevel::Moderate => vec![QueueAdmission, TrimCaches],
            DegradationLevel::Aggressive => vec![
                RejectAdmission,
                ClearCaches,
                ForceReclaim,
                DisableExpensiveOperations,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationAction {
    Throttle,
    OpportunisticCleanup,
    QueueAdmission,
    TrimCaches,
    RejectAdmission,
    ClearCaches,
    ForceReclaim,
    DisableExpensiveOperations,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub memory_usage_bytes: u64,
    pub concurrent_requests: usize,
    pub cache_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationStrategy {
    pub level: DegradationLevel,
    pub actions: Vec<DegradationAction>,
    /// Highest of the memory, concurrency and cache ratios.
    pub pressure: f64,
}

fn ratio(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        0.0
    } else {
        used / limit
    }
}

/// Derive the strategy for `usage` against the configured limits.
pub fn degradation_strategy(usage: &UsageSnapshot, limits: &ResourceConfig) -> DegradationStrategy {
    let pressure = ratio(usage.memory_usage_bytes as f64, limits.memory_limit_bytes as f64)
        .max(ratio(
            usage.concurrent_requests as f64,
            limits.max_concurrent_requests as f64,
        ))
        .max(ratio(usage.cache_size_bytes as f64, limits.max_cache_bytes as f64));
    let level = DegradationLevel::from_pressure(pressure);
    DegradationStrategy {
        level,
        actions: level.actions(),
        pressure,
    }
}

/// Output quality a tool should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySettings {
    pub image_quality: u8,
    pub resolution: u32,
    pub max_colors: u32,
    pub disable_animations: bool,
    pub disable_interactivity: bool,
}

impl QualitySettings {
    pub fn for_level(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::None => Self {
                image_quality: 100,
                resolution: 300,
                max_colors: 50,
                disable_animations: false,
                disable_interactivity: false,
            },
            DegradationLevel::Light => Self {
                image_quality: 85,
                resolution: 200,
                max_colors: 32,
                disable_animations: false,
                disable_interactivity: false,
            },
            DegradationLevel::Moderate => Self {
                image_quality: 70,
                resolution: 150,
                max_colors: 20,
                disable_animations: true,
                disable_interactivity: false,
            },
            DegradationLevel::Aggressive => Self {
                image_quality: 50,
                resolution: 72,
                max_colors: 10,
                disable_animations: true,
                disable_interactivity: true,
            },
        }
    }

    /// Expensive operations drop one level further once any degradation applies.
    pub fn for_operation(level: DegradationLevel, expensive: bool) -> Self {
        if expensive {
            Self::for_level(level.one_step_worse())
        } else {
            Self::for_level(level)
        }
    }
}
