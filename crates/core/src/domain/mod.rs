mod checkpoint;
mod failure;
mod metrics;
mod phase;
mod result;

pub use checkpoint::Checkpoint;
pub use failure::{EvidenceCheck, FailureKind, FailureRecord};
pub use metrics::{MemoryMetrics, MemoryTier};
pub use phase::{Phase, PhaseKind, PhaseStatus};
pub use result::{CostConfidence, MilestoneSummary, PhaseResult};
