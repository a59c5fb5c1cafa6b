//! The task record and its lifecycle

use crate::constants::{META_CREATED_AT, META_CREATOR, META_ESTIMATED_EFFORT};
use crate::errors::{Error, Result};
use crate::types::project::validate_project_id;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::ops::Deref;
use std::str::FromStr;

/// A validated, globally unique task identifier.
///
/// Identifiers end up inside file names (`{project}_{timestamp}_{id}.md`), so
/// only ASCII alphanumerics, `-` and `.` are accepted. Underscores are
/// reserved as the file name field separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Create a new TaskId with validation
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_task(id, "task id cannot be empty"));
        }
        if id.len() > 128 {
            return Err(Error::invalid_task(id, "task id exceeds 128 characters"));
        }
        if id.starts_with('.') {
            return Err(Error::invalid_task(id, "task id cannot start with '.'"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(Error::invalid_task(
                id,
                "task id must contain only ASCII alphanumerics, '-' and '.'",
            ));
        }
        Ok(TaskId(id))
    }

    /// Generate a fresh random identifier
    #[must_use]
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for TaskId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// What kind of work a task requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Implement,
    Analyze,
    Test,
    Refactor,
    Document,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Implement,
        TaskKind::Analyze,
        TaskKind::Test,
        TaskKind::Refactor,
        TaskKind::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Implement => "implement",
            TaskKind::Analyze => "analyze",
            TaskKind::Test => "test",
            TaskKind::Refactor => "refactor",
            TaskKind::Document => "document",
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::configuration(format!("unknown task kind '{s}'")))
    }
}

/// Task priority, ordered from least to most pressing
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| Error::configuration(format!("unknown priority '{s}'")))
    }
}

/// Queue state of a task.
///
/// The only legal sequence is `Pending -> Processing -> {Completed | Error}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    /// Completed and error are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Error)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code snippet attached to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
}

impl CodeFragment {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            language: None,
            content: content.into(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// A unit of requested work exchanged through the file queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub context: String,
    pub instructions: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub code: Vec<CodeFragment>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

impl Task {
    /// Create a pending task with a generated id and a `created_at` stamp
    pub fn new(
        project_id: impl Into<String>,
        kind: TaskKind,
        instructions: impl Into<String>,
    ) -> Self {
        let mut metadata = IndexMap::new();
        metadata.insert(META_CREATED_AT.to_string(), Utc::now().to_rfc3339());
        Self {
            id: TaskId::generate(),
            project_id: project_id.into(),
            kind,
            title: String::new(),
            context: String::new(),
            instructions: instructions.into(),
            files: Vec::new(),
            code: Vec::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            metadata,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn with_code(mut self, fragment: CodeFragment) -> Self {
        self.code.push(fragment);
        self
    }

    pub fn with_dependency(mut self, id: TaskId) -> Self {
        self.dependencies.push(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_creator(self, creator: impl Into<String>) -> Self {
        self.with_metadata(META_CREATOR, creator)
    }

    pub fn with_estimated_effort(self, effort: impl Into<String>) -> Self {
        self.with_metadata(META_ESTIMATED_EFFORT, effort)
    }

    /// Creation time from metadata, if present and well formed
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(META_CREATED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn creator(&self) -> Option<&str> {
        self.metadata.get(META_CREATOR).map(String::as_str)
    }

    /// Advance the queue state, rejecting anything but the legal sequence
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_task(
                self.id.as_str(),
                format!("illegal transition {} -> {}", self.status, next),
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Check invariants that do not need other tasks: the project id is safe
    /// inside a file name, a task never depends on itself and never lists
    /// the same dependency twice
    pub fn validate(&self) -> Result<()> {
        validate_project_id(&self.project_id)?;
        if self.instructions.trim().is_empty() {
            return Err(Error::invalid_task(self.id.as_str(), "instructions are empty"));
        }
        if self.dependencies.contains(&self.id) {
            return Err(Error::invalid_task(self.id.as_str(), "task depends on itself"));
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep) {
                return Err(Error::invalid_task(
                    self.id.as_str(),
                    format!("duplicate dependency '{dep}'"),
                ));
            }
        }
        Ok(())
    }
}
