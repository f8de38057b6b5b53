use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The named steps of a milestone, in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Research,
    Plan,
    Implement,
    Lint,
    Typecheck,
    Test,
    Integration,
    E2e,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 8] = [
        Self::Research,
        Self::Plan,
        Self::Implement,
        Self::Lint,
        Self::Typecheck,
        Self::Test,
        Self::Integration,
        Self::E2e,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Lint => "lint",
            Self::Typecheck => "typecheck",
            Self::Test => "test",
            Self::Integration => "integration",
            Self::E2e => "e2e",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "research" => Some(Self::Research),
            "plan" => Some(Self::Plan),
            "implement" => Some(Self::Implement),
            "lint" => Some(Self::Lint),
            "typecheck" => Some(Self::Typecheck),
            "test" => Some(Self::Test),
            "integration" => Some(Self::Integration),
            "e2e" => Some(Self::E2e),
            _ => None,
        }
    }

    /// Phases that only verify the implementation (their work is running a checker).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Lint | Self::Typecheck | Self::Test | Self::Integration | Self::E2e
        )
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Skipped
        )
    }

    /// Whether the pipeline may continue past a phase in this state.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Allowed lifecycle edges. `Pending -> Skipped` is the resume shortcut for
    /// phases whose checkpoint already says completed.
    pub fn can_transition_to(&self, to: PhaseStatus) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Running | Self::Skipped),
            Self::Running => matches!(to, Self::Completed | Self::Failed | Self::TimedOut),
            _ => false,
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a pipeline step.
///
/// Created `Pending` by the milestone driver; the phase runner moves it to
/// `Running` and then to exactly one terminal state. A retry after a terminal
/// state needs a fresh `Phase`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub kind: PhaseKind,
    pub description: String,
    pub max_turns: u32,
    pub timeout_seconds: u64,
    pub status: PhaseStatus,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub output: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(
        kind: PhaseKind,
        description: impl Into<String>,
        max_turns: u32,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            max_turns,
            timeout_seconds,
            status: PhaseStatus::Pending,
            session_id: None,
            cost_usd: 0.0,
            duration_ms: 0,
            error: None,
            output: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn transition(&mut self, to: PhaseStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidStatusTransition {
                phase: self.kind.as_str().to_string(),
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(PhaseStatus::Running)?;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    pub fn complete(
        &mut self,
        session_id: impl Into<String>,
        cost_usd: f64,
        output: impl Into<String>,
    ) -> Result<(), CoreError> {
        if !cost_usd.is_finite() || cost_usd < 0.0 {
            return Err(CoreError::Validation(format!(
                "phase {} reported invalid cost {}",
                self.kind, cost_usd
            )));
        }
        self.transition(PhaseStatus::Completed)?;
        self.session_id = Some(session_id.into());
        self.cost_usd = cost_usd;
        self.output = Some(output.into());
        self.finish();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(PhaseStatus::Failed)?;
        self.error = Some(error.into());
        self.finish();
        Ok(())
    }

    pub fn time_out(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(PhaseStatus::TimedOut)?;
        self.error = Some(error.into());
        self.finish();
        Ok(())
    }

    pub fn skip(&mut self, output: Option<String>) -> Result<(), CoreError> {
        self.transition(PhaseStatus::Skipped)?;
        self.output = output;
        Ok(())
    }

    /// Records a cost the tool reported even though the phase did not complete.
    pub fn record_cost(&mut self, cost_usd: f64) {
        if cost_usd.is_finite() && cost_usd >= self.cost_usd {
            self.cost_usd = cost_usd;
        }
    }

    fn finish(&mut self) {
        let end = Utc::now();
        let start = *self.start_time.get_or_insert(end);
        self.end_time = Some(end);
        self.duration_ms = (end - start).num_milliseconds().max(0) as u64;
    }
}
