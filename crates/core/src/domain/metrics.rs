use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time resource sample of the orchestrating process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub rss_mb: f64,
    pub vms_mb: f64,
    /// Process resident memory as a percentage of total system memory.
    pub percent: f64,
    pub available_system_mb: f64,
    pub cpu_percent: f64,
    pub timestamp: DateTime<Utc>,
    /// False when the platform could not be sampled; the numeric fields are
    /// then zero and carry no meaning.
    pub available: bool,
}

impl MemoryMetrics {
    pub fn unavailable() -> Self {
        Self {
            rss_mb: 0.0,
            vms_mb: 0.0,
            percent: 0.0,
            available_system_mb: 0.0,
            cpu_percent: 0.0,
            timestamp: Utc::now(),
            available: false,
        }
    }
}

/// Coarse size class of the host, fixed at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Low,
    Medium,
    High,
}

impl MemoryTier {
    pub fn from_total_gb(total_gb: f64) -> Self {
        if total_gb < 8.0 {
            Self::Low
        } else if total_gb < 32.0 {
            Self::Medium
        } else {
            Self::High
        }
    }

    /// Multiplier applied to phase retention budgets.
    pub fn budget_factor(&self) -> f64 {
        match self {
            Self::Low => 0.5,
            Self::Medium => 1.0,
            Self::High => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}
