//! RAII guards that keep persisted state consistent on early exit.
//!
//! - [`CheckpointGuard`] - Records a phase interrupted before its final checkpoint

mod checkpoint_guard;

pub use checkpoint_guard::{CheckpointGuard, INTERRUPTED_ERROR};
