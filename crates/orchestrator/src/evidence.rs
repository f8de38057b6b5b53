//! Per-phase evidence that the requested work was actually done.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use buildloop_core::EvidenceCheck;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::layout::ProjectLayout;

/// Artifacts at or below this size do not count as evidence of completion.
pub const DEFAULT_MIN_BYTES: u64 = 50;
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Where a phase's declared output lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLocation {
    /// A file in `.buildloop/milestones/milestone_<n>/`.
    Milestone(String),
    /// A path relative to the project root.
    Project(PathBuf),
}

impl ArtifactLocation {
    pub fn resolve(&self, layout: &ProjectLayout, milestone: u32) -> PathBuf {
        match self {
            Self::Milestone(file) => layout.milestone_dir(milestone).join(file),
            Self::Project(rel) => layout.root().join(rel),
        }
    }
}

impl std::fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Milestone(file) => write!(f, "milestone:{}", file),
            Self::Project(rel) => write!(f, "project:{}", rel.display()),
        }
    }
}

/// External check (linter, type checker, test runner) run in the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidationCommand {
    program: String,
    args: Vec<String>,
}

impl ValidationCommand {
    /// Split a command line on whitespace. No shell quoting is interpreted.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// True when the command exits 0 within the validation timeout.
    pub async fn passes(&self, layout: &ProjectLayout) -> bool {
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(layout.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %self, error = %e, "Failed to start validation command");
                return false;
            }
        };

        match tokio::time::timeout(VALIDATION_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(command = %self, code = ?status.code(), "Validation command finished");
                status.success()
            }
            Ok(Err(e)) => {
                warn!(command = %self, error = %e, "Validation command failed");
                false
            }
            Err(_) => {
                warn!(command = %self, "Validation command timed out");
                false
            }
        }
    }
}

impl std::fmt::Display for ValidationCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ValidationCommand {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| "validation command is empty".to_string())
    }
}

impl From<ValidationCommand> for String {
    fn from(value: ValidationCommand) -> Self {
        value.to_string()
    }
}

/// Evidence rule for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidencePredicate {
    pub artifact: ArtifactLocation,
    pub min_bytes: u64,
    pub validation: Option<ValidationCommand>,
}

impl EvidencePredicate {
    pub fn new(artifact: ArtifactLocation) -> Self {
        Self {
            artifact,
            min_bytes: DEFAULT_MIN_BYTES,
            validation: None,
        }
    }

    pub fn with_validation(mut self, validation: Option<ValidationCommand>) -> Self {
        self.validation = validation;
        self
    }

    pub fn artifact_path(&self, layout: &ProjectLayout, milestone: u32) -> PathBuf {
        self.artifact.resolve(layout, milestone)
    }

    async fn artifact_bytes(&self, layout: &ProjectLayout, milestone: u32) -> Option<u64> {
        let path = self.artifact_path(layout, milestone);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        }
    }

    /// The artifact exists and is non-empty. Required before `Completed`.
    pub async fn artifact_present(&self, layout: &ProjectLayout, milestone: u32) -> bool {
        matches!(self.artifact_bytes(layout, milestone).await, Some(len) if len > 0)
    }

    /// Full check used to recover from a transient failure: the artifact is
    /// larger than `min_bytes` and the validation command, if any, passes.
    pub async fn check(&self, layout: &ProjectLayout, milestone: u32) -> EvidenceCheck {
        let path = self.artifact_path(layout, milestone);
        let artifact_bytes = self.artifact_bytes(layout, milestone).await;
        let sized = matches!(artifact_bytes, Some(len) if len > self.min_bytes);

        // The validation run is skipped when the artifact already disqualifies.
        let validation_passed = match (&self.validation, sized) {
            (Some(command), true) => Some(command.passes(layout).await),
            _ => None,
        };

        EvidenceCheck {
            artifact: layout.relative(&path).display().to_string(),
            artifact_bytes,
            validation_passed,
            satisfied: sized && validation_passed.unwrap_or(true),
        }
    }
}
