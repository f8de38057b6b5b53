use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::PhaseKind;

/// Category of a phase failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The invocation exceeded its timeout.
    Timeout,
    /// A known teardown/cancellation race from the tool.
    TransientProtocol,
    /// The terminal message lacked a required field, or never arrived.
    MalformedResponse,
    /// Completion was reported but the declared artifact is absent.
    EvidenceMismatch,
    /// The tool itself reported an error result.
    AgentReported,
    /// Anything without a recognized signature.
    Unrecognized,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TransientProtocol => "transient_protocol",
            Self::MalformedResponse => "malformed_response",
            Self::EvidenceMismatch => "evidence_mismatch",
            Self::AgentReported => "agent_reported",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// What the evidence check found when a transient failure was classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceCheck {
    pub artifact: String,
    pub artifact_bytes: Option<u64>,
    pub validation_passed: Option<bool>,
    pub satisfied: bool,
}

/// Classification of a single error raised while consuming the tool's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: PhaseKind,
    pub attempt: u32,
    pub kind: FailureKind,
    pub message: String,
    pub is_retryable: bool,
    /// The error surfaced after useful work had likely been done.
    pub is_transient_cleanup_error: bool,
    pub evidence: Option<EvidenceCheck>,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(phase: PhaseKind, attempt: u32, kind: FailureKind, message: impl Into<String>) -> Self {
        let transient = kind == FailureKind::TransientProtocol;
        Self {
            phase,
            attempt,
            kind,
            message: message.into(),
            is_retryable: transient,
            is_transient_cleanup_error: transient,
            evidence: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_evidence(mut self, evidence: EvidenceCheck) -> Self {
        self.evidence = Some(evidence);
        self
    }
}
