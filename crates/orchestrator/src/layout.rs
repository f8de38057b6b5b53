//! On-disk layout of the `.buildloop/` state directory.
//!
//! Every file the orchestrator owns lives below `<project>/.buildloop/`:
//!
//! ```text
//! .buildloop/
//!   config.toml
//!   failures.jsonl
//!   checkpoints/milestone_<n>/<phase>_checkpoint.json
//!   milestones/milestone_<n>/{goal.md, research.md, plan.md, ..., summary.json}
//! ```

use std::path::{Path, PathBuf};

use buildloop_core::PhaseKind;
use tokio::fs;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Base directory for orchestrator state
pub const STATE_DIR: &str = ".buildloop";
const CHECKPOINTS_DIR: &str = "checkpoints";
const MILESTONES_DIR: &str = "milestones";
const CONFIG_FILE: &str = "config.toml";
const FAILURE_LOG_FILE: &str = "failures.jsonl";
const GOAL_FILE: &str = "goal.md";
const SUMMARY_FILE: &str = "summary.json";

/// Resolves every path the orchestrator reads or writes for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join(CONFIG_FILE)
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.state_dir().join(FAILURE_LOG_FILE)
    }

    pub fn checkpoints_dir(&self, milestone: u32) -> PathBuf {
        self.state_dir()
            .join(CHECKPOINTS_DIR)
            .join(format!("milestone_{}", milestone))
    }

    pub fn checkpoint_path(&self, milestone: u32, phase: PhaseKind) -> PathBuf {
        self.checkpoints_dir(milestone)
            .join(format!("{}_checkpoint.json", phase.as_str()))
    }

    pub fn milestone_dir(&self, milestone: u32) -> PathBuf {
        self.state_dir()
            .join(MILESTONES_DIR)
            .join(format!("milestone_{}", milestone))
    }

    pub fn goal_path(&self, milestone: u32) -> PathBuf {
        self.milestone_dir(milestone).join(GOAL_FILE)
    }

    pub fn summary_path(&self, milestone: u32) -> PathBuf {
        self.milestone_dir(milestone).join(SUMMARY_FILE)
    }

    /// Path relative to the project root, for prompts and display.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename, so
/// readers only ever observe the old or the new file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| OrchestratorError::store_write(path, "path has no parent directory"))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| OrchestratorError::store_write(parent, format!("create directory: {e}")))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    if let Err(e) = fs::write(&temp_path, contents).await {
        return Err(OrchestratorError::store_write(&temp_path, format!("write temp file: {e}")));
    }
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(OrchestratorError::store_write(path, format!("rename temp file: {e}")));
    }
    Ok(())
}
