//! Declarative per-phase execution policy.
//!
//! One row per [`PhaseKind`]: timeout, turn bound, retention budget, evidence
//! predicate and permitted tools. Project configuration and CLI flags
//! override individual cells; nothing else varies between phases.

use std::collections::BTreeMap;

use buildloop_core::{MemoryTier, Phase, PhaseKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::evidence::{ArtifactLocation, EvidencePredicate, ValidationCommand};
use crate::trimmer::RECENCY_ONLY_BUDGET;

const READ_TOOLS: [&str; 3] = ["Read", "Glob", "Grep"];

#[derive(Debug, Clone, PartialEq)]
pub struct PhasePolicy {
    pub kind: PhaseKind,
    pub description: String,
    pub timeout_seconds: u64,
    pub max_turns: u32,
    pub retention_budget: usize,
    pub evidence: EvidencePredicate,
    pub allowed_tools: Vec<String>,
}

impl PhasePolicy {
    pub fn defaults(kind: PhaseKind) -> Self {
        let (description, timeout_seconds, max_turns, retention_budget, artifact) = match kind {
            PhaseKind::Research => (
                "Research the milestone goal, existing code and relevant libraries",
                1800,
                30,
                150,
                ArtifactLocation::Milestone("research.md".into()),
            ),
            PhaseKind::Plan => (
                "Write an implementation plan from the research findings",
                1800,
                30,
                150,
                ArtifactLocation::Milestone("plan.md".into()),
            ),
            PhaseKind::Implement => (
                "Implement the plan in the project source tree",
                3600,
                80,
                300,
                ArtifactLocation::Project("src/main.rs".into()),
            ),
            PhaseKind::Lint => (
                "Run the linter and fix every reported issue",
                900,
                20,
                50,
                ArtifactLocation::Milestone("lint_report.md".into()),
            ),
            PhaseKind::Typecheck => (
                "Run the type checker and fix every reported error",
                900,
                20,
                50,
                ArtifactLocation::Milestone("typecheck_report.md".into()),
            ),
            PhaseKind::Test => (
                "Write and run unit tests until they pass",
                1800,
                40,
                100,
                ArtifactLocation::Milestone("test_report.md".into()),
            ),
            PhaseKind::Integration => (
                "Write and run integration tests until they pass",
                1800,
                40,
                100,
                ArtifactLocation::Milestone("integration_report.md".into()),
            ),
            PhaseKind::E2e => (
                "Exercise the finished program end to end and fix what breaks",
                2400,
                40,
                100,
                ArtifactLocation::Milestone("e2e_report.md".into()),
            ),
        };

        let mut allowed_tools: Vec<String> = READ_TOOLS.iter().map(|t| t.to_string()).collect();
        if kind == PhaseKind::Research {
            allowed_tools.extend(["WebSearch".to_string(), "WebFetch".to_string()]);
        }
        allowed_tools.push("Write".to_string());
        if kind == PhaseKind::Implement || kind.is_validation() {
            allowed_tools.extend(["Edit".to_string(), "Bash".to_string()]);
        }

        Self {
            kind,
            description: description.to_string(),
            timeout_seconds,
            max_turns,
            retention_budget,
            evidence: EvidencePredicate::new(artifact),
            allowed_tools,
        }
    }

    /// A fresh `Pending` phase carrying this row's bounds.
    pub fn new_phase(&self) -> Phase {
        Phase::new(
            self.kind,
            self.description.clone(),
            self.max_turns,
            self.timeout_seconds,
        )
    }

    fn apply(&mut self, o: &PhaseOverride) {
        if let Some(timeout_seconds) = o.timeout_seconds {
            self.timeout_seconds = timeout_seconds;
        }
        if let Some(max_turns) = o.max_turns {
            self.max_turns = max_turns;
        }
        if let Some(retention_budget) = o.retention_budget {
            self.retention_budget = retention_budget;
        }
        if let Some(ref artifact) = o.artifact {
            self.evidence.artifact = artifact.clone();
        }
        if let Some(min_bytes) = o.min_bytes {
            self.evidence.min_bytes = min_bytes;
        }
        if o.validation_command.is_some() {
            self.evidence.validation = o.validation_command.clone();
        }
        if let Some(ref tools) = o.allowed_tools {
            self.allowed_tools = tools.clone();
        }
    }
}

/// `[phases.<name>]` section of the project config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseOverride {
    pub timeout_seconds: Option<u64>,
    pub max_turns: Option<u32>,
    pub retention_budget: Option<usize>,
    pub artifact: Option<ArtifactLocation>,
    pub min_bytes: Option<u64>,
    pub validation_command: Option<ValidationCommand>,
    pub allowed_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    /// Indexed by `PhaseKind as usize`, which follows pipeline order.
    rows: Vec<PhasePolicy>,
}

impl PolicyTable {
    pub fn get(&self, kind: PhaseKind) -> &PhasePolicy {
        &self.rows[kind as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhasePolicy> {
        self.rows.iter()
    }

    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, PhaseOverride>) -> Result<()> {
        for (name, o) in overrides {
            let kind = PhaseKind::parse(name).ok_or_else(|| {
                OrchestratorError::Config(format!("unknown phase `{}` in [phases]", name))
            })?;
            self.rows[kind as usize].apply(o);
        }
        Ok(())
    }

    pub fn set_timeout(&mut self, kind: PhaseKind, timeout_seconds: u64) {
        self.rows[kind as usize].timeout_seconds = timeout_seconds;
    }

    /// Scale every retention budget once for the host's memory tier. Scaled
    /// budgets never fall below the recency-only threshold.
    pub fn scale_budgets(&mut self, tier: MemoryTier) {
        let factor = tier.budget_factor();
        for row in &mut self.rows {
            let scaled = (row.retention_budget as f64 * factor).round() as usize;
            row.retention_budget = scaled.max(RECENCY_ONLY_BUDGET);
        }
        debug!(tier = tier.as_str(), factor, "Retention budgets scaled");
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            rows: PhaseKind::ALL.into_iter().map(PhasePolicy::defaults).collect(),
        }
    }
}
