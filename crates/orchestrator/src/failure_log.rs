//! Append-only analysis log of classified failures.

use std::path::PathBuf;

use buildloop_core::FailureRecord;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::layout::ProjectLayout;

/// One JSON object per line in `.buildloop/failures.jsonl`.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(layout: &ProjectLayout) -> Self {
        Self {
            path: layout.failure_log_path(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a record. The log is diagnostic only, so failures are logged
    /// and otherwise ignored.
    pub async fn append(&self, record: &FailureRecord) {
        if let Err(e) = self.try_append(record).await {
            warn!(
                path = %self.path.display(),
                phase = %record.phase,
                error = %e,
                "Failed to append failure record"
            );
        }
    }

    async fn try_append(&self, record: &FailureRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Every record in the log; unparsable lines are skipped.
    pub async fn read_all(&self) -> Vec<FailureRecord> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
