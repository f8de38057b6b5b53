//! Domain model shared by the build-loop orchestrator and CLI.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
