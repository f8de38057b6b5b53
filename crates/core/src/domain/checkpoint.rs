use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::{Phase, PhaseStatus};
use super::result::CostConfidence;

/// Durable record of the last known outcome of one (milestone, phase) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub description: String,
    pub status: PhaseStatus,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    #[serde(default)]
    pub cost_confidence: CostConfidence,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn from_phase(phase: &Phase, cost_confidence: CostConfidence) -> Self {
        Self {
            name: phase.name().to_string(),
            description: phase.description.clone(),
            status: phase.status,
            session_id: phase.session_id.clone(),
            cost_usd: phase.cost_usd,
            cost_confidence,
            duration_ms: phase.duration_ms,
            error: phase.error.clone(),
            start_time: phase.start_time,
            end_time: phase.end_time,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }
}
