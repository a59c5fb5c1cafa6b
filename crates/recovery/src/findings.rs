//! Diagnostic findings and the report built from them

use chrono::{DateTime, Utc};
use filebridge_core::constants::{BRIDGE_CONFIG_FILENAME, PROJECTS_CONFIG_FILENAME};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Critical,
    High,
}

/// The two configuration files a bridge root carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFile {
    Bridge,
    Projects,
}

impl ConfigFile {
    pub const ALL: [ConfigFile; 2] = [ConfigFile::Bridge, ConfigFile::Projects];

    pub fn file_name(&self) -> &'static str {
        match self {
            ConfigFile::Bridge => BRIDGE_CONFIG_FILENAME,
            ConfigFile::Projects => PROJECTS_CONFIG_FILENAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FindingKind {
    MissingDirectory { path: PathBuf },
    MissingConfig { file: ConfigFile, path: PathBuf },
    CorruptConfig { file: ConfigFile, path: PathBuf, error: String },
    InsufficientPermissions { path: PathBuf },
    StaleProcessingTask { path: PathBuf, age_secs: u64 },
}

impl FindingKind {
    /// Repair order: directories before the files that live in them, fresh
    /// configuration before anything that reads it
    pub(crate) fn fix_rank(&self) -> u8 {
        match self {
            FindingKind::MissingDirectory { .. } => 0,
            FindingKind::MissingConfig { .. } => 1,
            FindingKind::CorruptConfig { .. } => 2,
            FindingKind::StaleProcessingTask { .. } => 3,
            FindingKind::InsufficientPermissions { .. } => 4,
        }
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            FindingKind::MissingDirectory { path }
            | FindingKind::MissingConfig { path, .. }
            | FindingKind::CorruptConfig { path, .. }
            | FindingKind::InsufficientPermissions { path }
            | FindingKind::StaleProcessingTask { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(flatten)]
    pub kind: FindingKind,
    pub severity: FindingSeverity,
    pub auto_fixable: bool,
    pub description: String,
}

impl Finding {
    pub fn missing_directory(path: PathBuf) -> Self {
        Self {
            description: format!("required directory '{}' is missing", path.display()),
            kind: FindingKind::MissingDirectory { path },
            severity: FindingSeverity::Critical,
            auto_fixable: true,
        }
    }

    pub fn missing_config(file: ConfigFile, path: PathBuf) -> Self {
        Self {
            description: format!("configuration file '{}' is missing", path.display()),
            kind: FindingKind::MissingConfig { file, path },
            severity: FindingSeverity::High,
            auto_fixable: true,
        }
    }

    pub fn corrupt_config(file: ConfigFile, path: PathBuf, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            description: format!("configuration file '{}' is malformed: {error}", path.display()),
            kind: FindingKind::CorruptConfig { file, path, error },
            severity: FindingSeverity::Critical,
            auto_fixable: true,
        }
    }

    pub fn insufficient_permissions(path: PathBuf, detail: impl fmt::Display) -> Self {
        Self {
            description: format!("insufficient permissions on '{}': {detail}", path.display()),
            kind: FindingKind::InsufficientPermissions { path },
            severity: FindingSeverity::Critical,
            auto_fixable: false,
        }
    }

    pub fn stale_processing(path: PathBuf, age_secs: u64) -> Self {
        Self {
            description: format!(
                "task '{}' has been processing for {age_secs}s",
                path.display()
            ),
            kind: FindingKind::StaleProcessingTask { path, age_secs },
            severity: FindingSeverity::High,
            auto_fixable: true,
        }
    }
}

/// Serializable outcome of one diagnosis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub root: PathBuf,
    pub findings: Vec<Finding>,
    pub healthy: bool,
}

impl DiagnosticReport {
    pub fn new(root: PathBuf, findings: Vec<Finding>) -> Self {
        Self {
            generated_at: Utc::now(),
            root,
            healthy: findings.is_empty(),
            findings,
        }
    }

    pub fn count(&self, severity: FindingSeverity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }

    pub fn fixable(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.auto_fixable)
    }
}
