use buildloop_core::{CoreError, FailureKind, PhaseKind};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase} timed out after {timeout_seconds}s ({message_count} messages received)")]
    Timeout {
        phase: PhaseKind,
        timeout_seconds: u64,
        message_count: usize,
    },

    #[error("Phase {phase} received a malformed response after {message_count} messages: {reason}")]
    MalformedResponse {
        phase: PhaseKind,
        message_count: usize,
        reason: String,
    },

    #[error(
        "Phase {phase} reported completion after {message_count} messages but artifact {} is missing or empty",
        .artifact.display()
    )]
    EvidenceMismatch {
        phase: PhaseKind,
        message_count: usize,
        artifact: PathBuf,
    },

    #[error("Phase {phase} ended with an agent error ({subtype}) after {message_count} messages: {detail}")]
    AgentReported {
        phase: PhaseKind,
        subtype: String,
        message_count: usize,
        detail: String,
    },

    #[error("Phase {phase} failed after {message_count} messages: {reason}")]
    PhaseExecutionFailed {
        phase: PhaseKind,
        message_count: usize,
        reason: String,
    },

    #[error(
        "Phase {phase}: manual intervention required after {attempts} attempts ({message_count} messages in last attempt). Prompt: {prompt_excerpt}"
    )]
    ManualIntervention {
        phase: PhaseKind,
        attempts: u32,
        message_count: usize,
        prompt_excerpt: String,
    },

    #[error("Checkpoint write failed for {}: {reason}", .path.display())]
    StoreWrite { path: PathBuf, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// The failure category this error is recorded under.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::ManualIntervention { .. } => FailureKind::TransientProtocol,
            Self::MalformedResponse { .. } => FailureKind::MalformedResponse,
            Self::EvidenceMismatch { .. } => FailureKind::EvidenceMismatch,
            Self::AgentReported { .. } => FailureKind::AgentReported,
            _ => FailureKind::Unrecognized,
        }
    }

    pub fn store_write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::StoreWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Where in the pipeline an error surfaced.
///
/// The runner keeps one of these per attempt so every fatal error can name
/// the phase and how far the message stream got.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub milestone: u32,
    pub phase: PhaseKind,
    pub attempt: u32,
    pub message_count: usize,
    pub session_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(milestone: u32, phase: PhaseKind) -> Self {
        Self {
            milestone,
            phase,
            attempt: 1,
            message_count: 0,
            session_id: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_message_count(mut self, message_count: usize) -> Self {
        self.message_count = message_count;
        self
    }

    pub fn malformed(&self, reason: impl Into<String>) -> OrchestratorError {
        OrchestratorError::MalformedResponse {
            phase: self.phase,
            message_count: self.message_count,
            reason: reason.into(),
        }
    }

    pub fn phase_failed(&self, reason: impl Into<String>) -> OrchestratorError {
        OrchestratorError::PhaseExecutionFailed {
            phase: self.phase,
            message_count: self.message_count,
            reason: reason.into(),
        }
    }

    pub fn timed_out(&self, timeout_seconds: u64) -> OrchestratorError {
        OrchestratorError::Timeout {
            phase: self.phase,
            timeout_seconds,
            message_count: self.message_count,
        }
    }
}
