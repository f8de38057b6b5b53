//! Phase orchestration for the build loop.
//!
//! A milestone is a fixed pipeline of phases (research through e2e). Each
//! phase is one invocation of an external coding agent, bounded by a
//! timeout and a turn limit, gated on evidence on disk and recorded as a
//! checkpoint so an interrupted milestone can resume.

pub mod agent;
pub mod checkpoint_store;
pub mod classifier;
pub mod config;
pub mod driver;
pub mod error;
pub mod evidence;
pub mod failure_log;
pub mod layout;
pub mod monitor;
pub mod policy;
pub mod prompts;
pub mod resources;
pub mod runner;
pub mod trimmer;

pub use agent::{AgentClient, AgentError, AgentOptions, ClaudeCliClient, PermissionMode};
pub use checkpoint_store::CheckpointStore;
pub use classifier::{FailureClassifier, Recovery, RetryPolicy};
pub use config::{AgentSettings, ProjectConfig};
pub use driver::MilestoneDriver;
pub use error::{ExecutionContext, OrchestratorError, Result};
pub use evidence::{ArtifactLocation, EvidencePredicate, ValidationCommand};
pub use failure_log::FailureLog;
pub use layout::ProjectLayout;
pub use monitor::{MemoryProbe, MonitorSettings, ResourceMonitor};
pub use policy::{PhaseOverride, PhasePolicy, PolicyTable};
pub use prompts::{PhasePrompts, PromptContext};
pub use runner::PhaseRunner;
