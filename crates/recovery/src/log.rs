//! Append-only JSON-lines record of repair attempts

use chrono::{DateTime, Utc};
use filebridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub target: String,
    /// `success` or `failure`
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryRecord {
    pub fn new(action: &str, target: &Path, result: &Result<()>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            target: target.display().to_string(),
            outcome: if result.is_ok() { "success" } else { "failure" }.to_string(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryLog {
    path: PathBuf,
}

impl RecoveryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &RecoveryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::file_system(parent, "create log directory", e))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::file_system(&self.path, "open recovery log", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::file_system(&self.path, "append recovery log", e))?;
        file.flush()
            .await
            .map_err(|e| Error::file_system(&self.path, "flush recovery log", e))?;
        Ok(())
    }

    /// Every record in the log; unreadable lines are skipped
    pub async fn read_all(&self) -> Result<Vec<RecoveryRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::file_system(&self.path, "read recovery log", e)),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
