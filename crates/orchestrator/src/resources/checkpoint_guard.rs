//! RAII guard that records an interrupted phase.
//!
//! The phase runner arms a guard when a phase starts running and disarms it
//! once the final checkpoint has been written. If the runner future is
//! dropped in between (caller-side cancellation, a panic unwinding), the
//! guard persists a `failed` checkpoint so a later resume does not trust a
//! stale `completed` record for that phase.

use buildloop_core::{Checkpoint, CostConfidence, Phase, PhaseKind, PhaseStatus};
use chrono::Utc;
use tracing::{debug, warn};

use crate::checkpoint_store::CheckpointStore;

pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

pub struct CheckpointGuard {
    store: CheckpointStore,
    milestone: u32,
    phase: PhaseKind,
    snapshot: Checkpoint,
    armed: bool,
}

impl CheckpointGuard {
    /// Arm a guard for a phase that has just started running.
    pub fn arm(store: CheckpointStore, milestone: u32, phase: &Phase) -> Self {
        debug!(milestone, phase = %phase.kind, "Checkpoint guard armed");
        Self {
            store,
            milestone,
            phase: phase.kind,
            snapshot: Checkpoint::from_phase(phase, CostConfidence::Unknown),
            armed: true,
        }
    }

    /// The final checkpoint was handled by the runner; do nothing on drop.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn interrupted_checkpoint(&self) -> Checkpoint {
        let mut checkpoint = self.snapshot.clone();
        let end = Utc::now();
        checkpoint.status = PhaseStatus::Failed;
        checkpoint.error = Some(INTERRUPTED_ERROR.to_string());
        checkpoint.end_time = Some(end);
        if let Some(start) = checkpoint.start_time {
            checkpoint.duration_ms = (end - start).num_milliseconds().max(0) as u64;
        }
        checkpoint
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            milestone = self.milestone,
            phase = %self.phase,
            "Phase dropped before its checkpoint was written - recording interruption"
        );

        // Cannot await in Drop; without a runtime there is nothing to spawn on.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let milestone = self.milestone;
        let phase = self.phase;
        let checkpoint = self.interrupted_checkpoint();

        handle.spawn(async move {
            if let Err(e) = store.write(milestone, phase, &checkpoint).await {
                warn!(milestone, phase = %phase, error = %e, "Interrupted checkpoint write failed");
            }
        });
    }
}
