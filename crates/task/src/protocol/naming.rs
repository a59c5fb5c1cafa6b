//! File names used in the queue and result directories

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use filebridge_core::constants::{
    FILENAME_TIMESTAMP_FORMAT, RESULT_FILE_SUFFIX, RESULT_SIDECAR_SUFFIX, TASK_FILE_EXTENSION,
    TASK_SIDECAR_SUFFIX,
};
use filebridge_core::{validate_project_id, Result, TaskId};

/// Millisecond stamp for superseded result names
const SUPERSEDED_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

/// Components of a canonical `{projectId}_{timestamp}_{taskId}.md` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFileName {
    pub project_id: String,
    pub timestamp: NaiveDateTime,
    pub task_id: TaskId,
}

impl TaskFileName {
    /// Fails when `project_id` is not safe inside a file name
    pub fn new(
        project_id: impl Into<String>,
        created: DateTime<Utc>,
        task_id: TaskId,
    ) -> Result<Self> {
        let project_id = project_id.into();
        validate_project_id(&project_id)?;
        Ok(Self {
            project_id,
            timestamp: created.trunc_subsecs(0).naive_utc(),
            task_id,
        })
    }

    /// Parse a file name. Task ids never contain `_`, so the name is split
    /// from the right and project ids may contain underscores.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{TASK_FILE_EXTENSION}"))?;
        if stem.ends_with(".meta") || stem.starts_with('.') {
            return None;
        }
        let mut parts = stem.rsplitn(3, '_');
        let task_id = TaskId::new(parts.next()?).ok()?;
        let timestamp =
            NaiveDateTime::parse_from_str(parts.next()?, FILENAME_TIMESTAMP_FORMAT).ok()?;
        let project_id = parts.next()?;
        validate_project_id(project_id).ok()?;
        Some(Self {
            project_id: project_id.to_string(),
            timestamp,
            task_id,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{TASK_FILE_EXTENSION}",
            self.project_id,
            self.timestamp.format(FILENAME_TIMESTAMP_FORMAT),
            self.task_id
        )
    }
}

/// True for `.md` files that could be task files (not temp or hidden files)
pub fn is_task_file_name(file_name: &str) -> bool {
    !file_name.starts_with('.')
        && file_name.ends_with(&format!(".{TASK_FILE_EXTENSION}"))
        && !file_name.ends_with(RESULT_FILE_SUFFIX)
}

pub fn task_sidecar_name(task_id: &TaskId) -> String {
    format!("{task_id}{TASK_SIDECAR_SUFFIX}")
}

pub fn result_file_name(task_id: &TaskId) -> String {
    format!("{task_id}{RESULT_FILE_SUFFIX}")
}

pub fn result_sidecar_name(task_id: &TaskId) -> String {
    format!("{task_id}{RESULT_SIDECAR_SUFFIX}")
}

/// Audit names for a result replaced by a retry. `nonce` keeps names
/// apart when several results are superseded within one millisecond.
pub fn superseded_names(task_id: &TaskId, at: DateTime<Utc>, nonce: &str) -> (String, String) {
    let stamp = at.format(SUPERSEDED_STAMP_FORMAT);
    (
        format!("{task_id}_result.superseded-{stamp}-{nonce}.md"),
        format!("{task_id}_result.superseded-{stamp}-{nonce}.meta.json"),
    )
}
