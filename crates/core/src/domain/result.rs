use serde::{Deserialize, Serialize};

use super::phase::{Phase, PhaseKind, PhaseStatus};

/// How much the recorded cost of a phase can be trusted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostConfidence {
    /// Taken from the tool's terminal message.
    #[default]
    Reported,
    /// The terminal message was lost; the recorded figure is a placeholder.
    Unknown,
}

/// Structured outcome of one phase, handed back to the milestone driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PhaseKind,
    pub status: PhaseStatus,
    pub cost_usd: f64,
    pub cost_confidence: CostConfidence,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub output: Option<String>,
    /// Messages seen during the final attempt (before trimming).
    pub message_count: usize,
    pub attempts: u32,
    /// False when the checkpoint write failed and resume is not guaranteed.
    pub checkpoint_persisted: bool,
}

impl PhaseResult {
    pub fn from_phase(phase: &Phase, cost_confidence: CostConfidence) -> Self {
        Self {
            phase: phase.kind,
            status: phase.status,
            cost_usd: phase.cost_usd,
            cost_confidence,
            duration_ms: phase.duration_ms,
            session_id: phase.session_id.clone(),
            error: phase.error.clone(),
            output: phase.output.clone(),
            message_count: 0,
            attempts: 0,
            checkpoint_persisted: true,
        }
    }

    pub fn with_message_count(mut self, message_count: usize) -> Self {
        self.message_count = message_count;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Aggregated outcome of a milestone run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSummary {
    pub milestone: u32,
    pub results: Vec<PhaseResult>,
    /// Sum of reported costs; a lower bound when `unknown_cost_phases` is non-empty.
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub unknown_cost_phases: Vec<PhaseKind>,
    pub succeeded: bool,
    pub failed_phase: Option<PhaseKind>,
}

impl MilestoneSummary {
    pub fn new(milestone: u32) -> Self {
        Self {
            milestone,
            results: Vec::new(),
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            unknown_cost_phases: Vec::new(),
            succeeded: true,
            failed_phase: None,
        }
    }

    pub fn push(&mut self, result: PhaseResult) {
        match result.cost_confidence {
            CostConfidence::Reported => self.total_cost_usd += result.cost_usd,
            CostConfidence::Unknown => self.unknown_cost_phases.push(result.phase),
        }
        self.total_duration_ms += result.duration_ms;
        if !result.is_success() && self.failed_phase.is_none() {
            self.succeeded = false;
            self.failed_phase = Some(result.phase);
        }
        self.results.push(result);
    }

    pub fn cost_is_lower_bound(&self) -> bool {
        !self.unknown_cost_phases.is_empty()
    }
}
