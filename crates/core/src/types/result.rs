//! The immutable outcome record produced for exactly one task

use super::task::TaskId;
use crate::errors::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Overall outcome of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
    Partial,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
            ResultStatus::Partial => "partial",
        }
    }

    /// Partial results still count as delivered work
    pub fn is_error(&self) -> bool {
        matches!(self, ResultStatus::Error)
    }
}

impl Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(ResultStatus::Success),
            "error" => Ok(ResultStatus::Error),
            "partial" => Ok(ResultStatus::Partial),
            other => Err(Error::configuration(format!(
                "unknown result status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            other => Err(Error::configuration(format!("unknown change kind '{other}'"))),
        }
    }
}

/// One entry of a result changeset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Signed size delta in bytes
    #[serde(default)]
    pub size_delta: i64,
    /// Signed line count delta
    #[serde(default)]
    pub line_delta: i64,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            size_delta: 0,
            line_delta: 0,
        }
    }

    pub fn with_deltas(mut self, size_delta: i64, line_delta: i64) -> Self {
        self.size_delta = size_delta;
        self.line_delta = line_delta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::configuration(format!("unknown severity '{other}'"))),
        }
    }
}

/// A problem reported by an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Issue {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }
}

/// Wall-clock timing of one execution, kept at millisecond precision so the
/// text and JSON forms agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionMetrics {
    pub fn between(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        let started_at = started_at.trunc_subsecs(3);
        let completed_at = completed_at.trunc_subsecs(3);
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            started_at,
            completed_at,
            duration_ms,
        }
    }

    /// Zero-length metrics stamped now, for results produced without running
    pub fn instant() -> Self {
        let now = Utc::now();
        Self::between(now, now)
    }
}

/// Outcome record for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: ResultStatus,
    pub summary: String,
    #[serde(default)]
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    pub metrics: ExecutionMetrics,
}

impl TaskResult {
    pub fn new(task_id: TaskId, status: ResultStatus, summary: impl Into<String>) -> Self {
        Self {
            task_id,
            status,
            summary: summary.into(),
            changes: Vec::new(),
            output: String::new(),
            issues: Vec::new(),
            next_steps: Vec::new(),
            metrics: ExecutionMetrics::instant(),
        }
    }

    pub fn success(task_id: TaskId, summary: impl Into<String>) -> Self {
        Self::new(task_id, ResultStatus::Success, summary)
    }

    /// An error result carrying the failure as a single error issue
    pub fn error(task_id: TaskId, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(task_id, ResultStatus::Error, message.clone())
            .with_issue(Issue::new(Severity::Error, message))
    }

    pub fn with_change(mut self, change: FileChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_steps.push(step.into());
        self
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn changes_of(&self, kind: ChangeKind) -> impl Iterator<Item = &FileChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }
}
