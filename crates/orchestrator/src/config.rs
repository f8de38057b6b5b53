use std::collections::BTreeMap;
use std::path::PathBuf;

use buildloop_core::MemoryTier;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::agent::PermissionMode;
use crate::classifier::RetryPolicy;
use crate::error::Result;
use crate::layout::ProjectLayout;
use crate::monitor::MonitorSettings;
use crate::policy::{PhaseOverride, PolicyTable};

/// `[agent]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent executable; looked up on `PATH` when unset.
    pub binary: Option<PathBuf>,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
}

/// Project-level configuration stored in `.buildloop/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub agent: AgentSettings,
    pub monitor: MonitorSettings,
    pub retry: RetryPolicy,
    pub phases: BTreeMap<String, PhaseOverride>,
}

impl ProjectConfig {
    /// Read config from the project. A missing file gives defaults; an
    /// unreadable or invalid one is reported and also gives defaults.
    pub async fn read(layout: &ProjectLayout) -> Self {
        let config_path = layout.config_path();

        let content = match fs::read_to_string(&config_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %config_path.display(), "Config file does not exist, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                return Self::default();
            }
        };

        match Self::parse(&content) {
            Ok(config) => {
                debug!(path = %config_path.display(), "Config loaded successfully");
                config
            }
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Effective policy table: defaults, then `[phases]` overrides, then
    /// retention budgets scaled for `tier`.
    pub fn policy_table(&self, tier: MemoryTier) -> Result<PolicyTable> {
        let mut table = PolicyTable::default();
        table.apply_overrides(&self.phases)?;
        table.scale_budgets(tier);
        Ok(table)
    }
}
