//! Durable per-(milestone, phase) checkpoints.

use buildloop_core::{Checkpoint, PhaseKind};
use tokio::fs;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::layout::{write_atomic, ProjectLayout};

/// Reads and writes checkpoint files under `.buildloop/checkpoints/`.
///
/// Writes replace the file atomically, so a second process reading the
/// store while this one writes sees either the previous or the new
/// checkpoint. Later writes for the same key win.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: ProjectLayout,
}

impl CheckpointStore {
    pub fn new(layout: ProjectLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub async fn write(&self, milestone: u32, phase: PhaseKind, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.layout.checkpoint_path(milestone, phase);
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| OrchestratorError::Serialization(format!("checkpoint {}: {}", phase, e)))?;

        write_atomic(&path, &json).await?;
        debug!(
            milestone,
            phase = %phase,
            status = %checkpoint.status,
            path = %path.display(),
            "Checkpoint written"
        );
        Ok(())
    }

    pub async fn read(&self, milestone: u32, phase: PhaseKind) -> Result<Option<Checkpoint>> {
        let path = self.layout.checkpoint_path(milestone, phase);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::Serialization(format!(
                "Failed to parse checkpoint {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(checkpoint))
    }

    /// All checkpoints of a milestone, in pipeline order.
    pub async fn read_milestone(&self, milestone: u32) -> Result<Vec<(PhaseKind, Checkpoint)>> {
        let mut checkpoints = Vec::new();
        for phase in PhaseKind::ALL {
            if let Some(checkpoint) = self.read(milestone, phase).await? {
                checkpoints.push((phase, checkpoint));
            }
        }
        Ok(checkpoints)
    }
}
