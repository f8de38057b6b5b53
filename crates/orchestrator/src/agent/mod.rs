//! Boundary to the external coding agent.
//!
//! The agent is a black box: it takes one prompt plus a small options struct
//! and yields a stream of raw JSON messages, ending either with a terminal
//! `result` message or with an error. Interpretation of those messages is
//! owned by [`normalize`], never by the agent implementation.

mod claude_cli;
pub mod normalize;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::PathBuf;
use thiserror::Error;

pub use claude_cli::ClaudeCliClient;
pub use normalize::{normalize_message, resolve_cost, AgentMessage, MalformedMessage, TerminalMessage};

/// Raw messages as produced by the agent, in arrival order.
pub type MessageStream = BoxStream<'static, Result<serde_json::Value, AgentError>>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Agent protocol error: {0}")]
    Protocol(String),

    #[error("Agent exited with status {code:?}: {stderr}")]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("Agent IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the agent may act on the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    #[default]
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_turns: u32,
    /// Tool names the agent may use; empty means the agent's own default set.
    pub allowed_tools: Vec<String>,
    pub working_dir: PathBuf,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
}

impl AgentOptions {
    pub fn new(working_dir: impl Into<PathBuf>, max_turns: u32) -> Self {
        Self {
            max_turns,
            allowed_tools: Vec::new(),
            working_dir: working_dir.into(),
            permission_mode: PermissionMode::default(),
            model: None,
        }
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Start one invocation. Errors returned here happen before any message
    /// was produced; errors inside the stream happen while consuming it.
    async fn query(&self, prompt: &str, options: &AgentOptions) -> Result<MessageStream, AgentError>;
}
