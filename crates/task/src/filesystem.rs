//! The bridge directory tree and every queue move inside it
//!
//! A task's queue state is the directory its file sits in. All state
//! changes are single `rename` calls within one filesystem, so a file is
//! always in exactly one state and two racing workers cannot both move it.

use crate::protocol::{
    is_task_file_name, parse_result, parse_task, render_result, render_task, result_file_name,
    result_sidecar_name, superseded_names, task_sidecar_name, TaskFileName,
};
use chrono::Utc;
use filebridge_core::constants::*;
use filebridge_core::{Error, Result, ResultStatus, Task, TaskId, TaskResult, TaskStatus};
use filebridge_utils::write_atomic_async;
use serde::Serialize;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use uuid::Uuid;

/// Directory-backed queue states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Error,
    Quarantine,
}

impl QueueState {
    pub const ALL: [QueueState; 5] = [
        QueueState::Pending,
        QueueState::Processing,
        QueueState::Completed,
        QueueState::Error,
        QueueState::Quarantine,
    ];

    pub fn dir(&self) -> &'static str {
        match self {
            QueueState::Pending => TASKS_PENDING_DIR,
            QueueState::Processing => TASKS_PROCESSING_DIR,
            QueueState::Completed => TASKS_COMPLETED_DIR,
            QueueState::Error => TASKS_ERROR_DIR,
            QueueState::Quarantine => TASKS_QUARANTINE_DIR,
        }
    }

    /// The task status a file in this directory has. Quarantined files never
    /// parsed, so they have none.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            QueueState::Pending => Some(TaskStatus::Pending),
            QueueState::Processing => Some(TaskStatus::Processing),
            QueueState::Completed => Some(TaskStatus::Completed),
            QueueState::Error => Some(TaskStatus::Error),
            QueueState::Quarantine => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The task file now lives at this path in `tasks/processing`
    Claimed(PathBuf),
    /// Someone else moved the file first
    AlreadyClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Moved(PathBuf),
    /// The source was gone; nothing was moved
    Missing,
}

/// Per-directory file counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub quarantine: usize,
    pub results_success: usize,
    pub results_error: usize,
}

#[derive(Debug, Clone)]
pub struct BridgeFileSystem {
    root: PathBuf,
}

fn file_name_of(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Set a file's modification time to now
async fn touch(path: &Path) -> Result<()> {
    let target = path.to_path_buf();
    let touched = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&target)
            .and_then(|f| f.set_modified(SystemTime::now()))
    })
    .await
    .map_err(|e| Error::file_system(path, "touch", std::io::Error::other(e.to_string())))?;
    touched.map_err(|e| Error::file_system(path, "touch", e))
}

/// Rename, mapping a vanished source to `Ok(false)`
async fn rename_if_present(from: &Path, to: &Path) -> Result<bool> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::file_system(from, "rename", e)),
    }
}

impl BridgeFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir())
    }

    pub fn results_dir(&self, status: ResultStatus) -> PathBuf {
        if status.is_error() {
            self.root.join(RESULTS_ERROR_DIR)
        } else {
            self.root.join(RESULTS_SUCCESS_DIR)
        }
    }

    /// Create every required directory. Safe to call repeatedly; existing
    /// content is never touched.
    pub async fn initialize_structure(&self) -> Result<()> {
        for dir in REQUIRED_DIRS {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| Error::file_system(&path, "create directory", e))?;
        }
        tracing::debug!(root = %self.root.display(), "bridge directory structure ready");
        Ok(())
    }

    /// Write a new task into `tasks/pending` under its canonical name.
    ///
    /// The sidecar is written first so a watcher that sees the task file can
    /// rely on it.
    pub async fn write_task(&self, task: &Task) -> Result<PathBuf> {
        task.validate()?;
        let created = task.created_at().unwrap_or_else(Utc::now);
        let name = TaskFileName::new(task.project_id.clone(), created, task.id.clone())?;
        let dir = self.state_dir(QueueState::Pending);

        let sidecar = serde_json::to_vec_pretty(task)?;
        write_atomic_async(&dir.join(task_sidecar_name(&task.id)), &sidecar).await?;

        let path = dir.join(name.file_name());
        write_atomic_async(&path, render_task(task).as_bytes()).await?;
        tracing::debug!(task_id = %task.id, path = %path.display(), "task file written");
        Ok(path)
    }

    pub async fn read_task(&self, path: &Path) -> Result<Task> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|e| Error::file_system(path, "read task file", e))?;
        parse_task(&text, path)
    }

    /// Task files in one state directory, sorted by name
    pub async fn list(&self, state: QueueState) -> Result<Vec<PathBuf>> {
        let dir = self.state_dir(state);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::file_system(&dir, "list directory", e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::file_system(&dir, "list directory", e))?
        {
            let path = entry.path();
            if file_name_of(&path).is_some_and(is_task_file_name) && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Pending task files, newest first by the timestamp in their name.
    /// Files without a canonical name sort last.
    pub async fn list_pending(&self) -> Result<Vec<PathBuf>> {
        let mut files = self.list(QueueState::Pending).await?;
        files.sort_by(|a, b| {
            let ta = file_name_of(a).and_then(TaskFileName::parse).map(|n| n.timestamp);
            let tb = file_name_of(b).and_then(TaskFileName::parse).map(|n| n.timestamp);
            tb.cmp(&ta).then_with(|| a.cmp(b))
        });
        Ok(files)
    }

    /// Find which state a task id is in
    pub async fn locate(&self, task_id: &TaskId) -> Result<Option<(QueueState, PathBuf)>> {
        for state in QueueState::ALL {
            for path in self.list(state).await? {
                let Some(name) = file_name_of(&path) else {
                    continue;
                };
                match TaskFileName::parse(name) {
                    Some(parsed) if &parsed.task_id == task_id => return Ok(Some((state, path))),
                    Some(_) => {}
                    // Hand-written pending files are identified by their content
                    None if state == QueueState::Pending => {
                        if let Ok(task) = self.read_task(&path).await {
                            if &task.id == task_id {
                                return Ok(Some((state, path)));
                            }
                        }
                    }
                    None => {}
                }
            }
        }
        Ok(None)
    }

    /// Claim a pending task by id
    pub async fn claim(&self, task_id: &TaskId) -> Result<ClaimOutcome> {
        match self.locate(task_id).await? {
            Some((QueueState::Pending, path)) => {
                let task = self.read_task(&path).await?;
                self.claim_file(&path, &task).await
            }
            _ => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }

    /// Move a parsed pending file into `tasks/processing`.
    ///
    /// The file keeps its name when it is already canonical for this task and
    /// is renamed to the canonical name otherwise. Losing the race to another
    /// claimer yields [`ClaimOutcome::AlreadyClaimed`]. A project id that is
    /// not file-name safe is refused before anything moves.
    pub async fn claim_file(&self, path: &Path, task: &Task) -> Result<ClaimOutcome> {
        let canonical = match file_name_of(path)
            .and_then(TaskFileName::parse)
            .filter(|name| name.task_id == task.id)
        {
            Some(name) => name,
            None => {
                let created = task.created_at().unwrap_or_else(Utc::now);
                TaskFileName::new(task.project_id.clone(), created, task.id.clone())?
            }
        };

        let dest = self
            .state_dir(QueueState::Processing)
            .join(canonical.file_name());
        if !rename_if_present(path, &dest).await? {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        // Stranded-task detection works from the claim time
        if let Err(e) = touch(&dest).await {
            tracing::warn!(task_id = %task.id, error = %e, "failed to reset claimed task mtime");
        }

        self.move_sidecar(&task.id, QueueState::Pending, QueueState::Processing)
            .await;
        tracing::debug!(task_id = %task.id, path = %dest.display(), "task claimed");
        Ok(ClaimOutcome::Claimed(dest))
    }

    /// Move a processing task into its terminal directory
    pub async fn finish(&self, task_id: &TaskId, status: TaskStatus) -> Result<FinishOutcome> {
        let target = match status {
            TaskStatus::Completed => QueueState::Completed,
            TaskStatus::Error => QueueState::Error,
            other => {
                return Err(Error::invalid_task(
                    task_id.as_str(),
                    format!("cannot finish into non-terminal status {other}"),
                ))
            }
        };

        let Some(source) = self.processing_path(task_id).await? else {
            tracing::debug!(task_id = %task_id, "task no longer in processing");
            return Ok(FinishOutcome::Missing);
        };

        let outcome = self.move_to(&source, target).await?;
        if matches!(outcome, FinishOutcome::Moved(_)) {
            self.move_sidecar(task_id, QueueState::Processing, target).await;
        }
        Ok(outcome)
    }

    /// Hand a claimed task back to `tasks/pending`, for when nothing is left
    /// to run it
    pub async fn release(&self, task_id: &TaskId) -> Result<FinishOutcome> {
        let Some(source) = self.processing_path(task_id).await? else {
            return Ok(FinishOutcome::Missing);
        };
        let outcome = self.move_to(&source, QueueState::Pending).await?;
        if matches!(outcome, FinishOutcome::Moved(_)) {
            self.move_sidecar(task_id, QueueState::Processing, QueueState::Pending)
                .await;
        }
        Ok(outcome)
    }

    /// The task's file in `tasks/processing`, if it is still there
    pub async fn processing_path(&self, task_id: &TaskId) -> Result<Option<PathBuf>> {
        Ok(self
            .list(QueueState::Processing)
            .await?
            .into_iter()
            .find(|p| {
                file_name_of(p)
                    .and_then(TaskFileName::parse)
                    .is_some_and(|n| &n.task_id == task_id)
            }))
    }

    /// Refresh the claim time of a task still in `tasks/processing`.
    /// Returns false when the file is no longer there.
    pub async fn touch_processing(&self, task_id: &TaskId) -> Result<bool> {
        match self.processing_path(task_id).await? {
            Some(path) => touch(&path).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Park an unparseable pending file
    pub async fn quarantine(&self, path: &Path) -> Result<FinishOutcome> {
        let outcome = self.move_to(path, QueueState::Quarantine).await?;
        if let Some(name) = file_name_of(path).and_then(TaskFileName::parse) {
            self.move_sidecar(&name.task_id, QueueState::Pending, QueueState::Quarantine)
                .await;
        }
        Ok(outcome)
    }

    /// Rename `path` into `state`'s directory, keeping its file name
    pub async fn move_to(&self, path: &Path, state: QueueState) -> Result<FinishOutcome> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::configuration(format!("'{}' has no file name", path.display())))?;
        let dest = self.state_dir(state).join(name);
        if rename_if_present(path, &dest).await? {
            Ok(FinishOutcome::Moved(dest))
        } else {
            Ok(FinishOutcome::Missing)
        }
    }

    async fn move_sidecar(&self, task_id: &TaskId, from: QueueState, to: QueueState) {
        let name = task_sidecar_name(task_id);
        let source = self.state_dir(from).join(&name);
        if let Err(e) = rename_if_present(&source, &self.state_dir(to).join(&name)).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to move task sidecar");
        }
    }

    /// Write a result and its sidecar.
    ///
    /// An earlier result for the same task (a retry) is renamed aside with a
    /// `superseded-<timestamp>` marker instead of being overwritten.
    pub async fn write_result(&self, result: &TaskResult) -> Result<PathBuf> {
        let md_name = result_file_name(&result.task_id);
        let json_name = result_sidecar_name(&result.task_id);

        for dir in [
            self.root.join(RESULTS_SUCCESS_DIR),
            self.root.join(RESULTS_ERROR_DIR),
        ] {
            let existing = dir.join(&md_name);
            if fs::try_exists(&existing).await.unwrap_or(false) {
                let nonce = Uuid::new_v4().simple().to_string();
                let (old_md, old_json) =
                    superseded_names(&result.task_id, Utc::now(), &nonce[..8]);
                rename_if_present(&existing, &dir.join(old_md)).await?;
                rename_if_present(&dir.join(&json_name), &dir.join(old_json)).await?;
                tracing::info!(task_id = %result.task_id, "previous result superseded");
            }
        }

        let dir = self.results_dir(result.status);
        let sidecar = serde_json::to_vec_pretty(result)?;
        write_atomic_async(&dir.join(&json_name), &sidecar).await?;

        let path = dir.join(md_name);
        write_atomic_async(&path, render_result(result).as_bytes()).await?;
        tracing::debug!(
            task_id = %result.task_id,
            status = %result.status,
            path = %path.display(),
            "result written"
        );
        Ok(path)
    }

    /// Current result for a task, if one has been written
    pub async fn read_result(&self, task_id: &TaskId) -> Result<Option<TaskResult>> {
        let name = result_file_name(task_id);
        for dir in [
            self.root.join(RESULTS_SUCCESS_DIR),
            self.root.join(RESULTS_ERROR_DIR),
        ] {
            let path = dir.join(&name);
            match fs::read_to_string(&path).await {
                Ok(text) => return parse_result(&text, &path).map(Some),
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(Error::file_system(&path, "read result", e)),
            }
        }
        Ok(None)
    }

    /// Delete terminal task files, quarantined files and result files last
    /// modified more than `max_age` ago. Pending and processing are never
    /// touched.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for dir in [
            TASKS_COMPLETED_DIR,
            TASKS_ERROR_DIR,
            TASKS_QUARANTINE_DIR,
            RESULTS_SUCCESS_DIR,
            RESULTS_ERROR_DIR,
        ] {
            let dir = self.root.join(dir);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(Error::file_system(&dir, "list directory", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::file_system(&dir, "list directory", e))?
            {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                let old = metadata.is_file()
                    && metadata.modified().map(|m| m < cutoff).unwrap_or(false);
                if !old {
                    continue;
                }
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == IoErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %entry.path().display(), error = %e, "cleanup failed")
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "old task and result files removed");
        }
        Ok(removed)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.list(QueueState::Pending).await?.len(),
            processing: self.list(QueueState::Processing).await?.len(),
            completed: self.list(QueueState::Completed).await?.len(),
            error: self.list(QueueState::Error).await?.len(),
            quarantine: self.list(QueueState::Quarantine).await?.len(),
            results_success: self.count_results(RESULTS_SUCCESS_DIR).await?,
            results_error: self.count_results(RESULTS_ERROR_DIR).await?,
        })
    }

    async fn count_results(&self, dir: &str) -> Result<usize> {
        let dir = self.root.join(dir);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::file_system(&dir, "list directory", e)),
        };
        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::file_system(&dir, "list directory", e))?
        {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(RESULT_FILE_SUFFIX))
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filebridge_core::{Priority, TaskKind};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, BridgeFileSystem) {
        let temp = TempDir::new().unwrap();
        let fs = BridgeFileSystem::new(temp.path());
        fs.initialize_structure().await.unwrap();
        (temp, fs)
    }

    fn task(id: &str) -> Task {
        Task::new("tech", TaskKind::Implement, "do the thing").with_id(TaskId::new(id).unwrap())
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_preserves_content() {
        let (temp, fs) = setup().await;
        let keep = temp.path().join(TASKS_PENDING_DIR).join("keep.md");
        std::fs::write(&keep, "x").unwrap();
        fs.initialize_structure().await.unwrap();
        for dir in REQUIRED_DIRS {
            assert!(temp.path().join(dir).is_dir(), "{dir} missing");
        }
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn test_claim_and_finish_move_file_and_sidecar() {
        let (temp, fs) = setup().await;
        let t = task("t1");
        let written = fs.write_task(&t).await.unwrap();
        assert!(temp.path().join(TASKS_PENDING_DIR).join("t1.meta.json").exists());

        let ClaimOutcome::Claimed(claimed) = fs.claim_file(&written, &t).await.unwrap() else {
            panic!("expected claim");
        };
        assert!(!written.exists());
        assert!(claimed.starts_with(temp.path().join(TASKS_PROCESSING_DIR)));
        assert!(temp.path().join(TASKS_PROCESSING_DIR).join("t1.meta.json").exists());

        let outcome = fs.finish(&t.id, TaskStatus::Completed).await.unwrap();
        let FinishOutcome::Moved(done) = outcome else {
            panic!("expected move");
        };
        assert!(done.starts_with(temp.path().join(TASKS_COMPLETED_DIR)));
        assert!(temp.path().join(TASKS_COMPLETED_DIR).join("t1.meta.json").exists());
        assert_eq!(fs.locate(&t.id).await.unwrap().map(|(s, _)| s), Some(QueueState::Completed));
    }

    #[tokio::test]
    async fn test_second_claim_observes_already_claimed() {
        let (_temp, fs) = setup().await;
        let t = task("t1");
        let path = fs.write_task(&t).await.unwrap();
        assert!(matches!(fs.claim_file(&path, &t).await.unwrap(), ClaimOutcome::Claimed(_)));
        assert_eq!(fs.claim_file(&path, &t).await.unwrap(), ClaimOutcome::AlreadyClaimed);
        assert_eq!(fs.claim(&t.id).await.unwrap(), ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_exactly_one_wins() {
        let (_temp, fs) = setup().await;
        let fs = Arc::new(fs);
        let t = task("race");
        let path = fs.write_task(&t).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fs = Arc::clone(&fs);
            let path = path.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move { fs.claim_file(&path, &t).await }));
        }
        let mut wins = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), ClaimOutcome::Claimed(_)) {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_finish_missing_and_non_terminal() {
        let (_temp, fs) = setup().await;
        let id = TaskId::new("ghost").unwrap();
        assert_eq!(fs.finish(&id, TaskStatus::Error).await.unwrap(), FinishOutcome::Missing);
        assert!(fs.finish(&id, TaskStatus::Processing).await.is_err());
    }

    #[tokio::test]
    async fn test_hand_written_file_claimed_under_canonical_name() {
        let (temp, fs) = setup().await;
        let path = temp.path().join(TASKS_PENDING_DIR).join("manual.md");
        std::fs::write(
            &path,
            "## BRIDGE_TASK: analyze\n### Project\ntech\n### Task\nLook\n### Metadata\n- task_id: m1\n---\n",
        )
        .unwrap();

        let t = fs.read_task(&path).await.unwrap();
        let ClaimOutcome::Claimed(dest) = fs.claim(&t.id).await.unwrap() else {
            panic!("expected claim");
        };
        let name = TaskFileName::parse(dest.file_name().unwrap().to_str().unwrap()).unwrap();
        assert_eq!(name.task_id.as_str(), "m1");
        assert_eq!(name.project_id, "tech");
    }

    #[tokio::test]
    async fn test_list_pending_newest_first() {
        let (_temp, fs) = setup().await;
        let old = task("old").with_metadata(META_CREATED_AT, "2026-01-01T00:00:00+00:00");
        let new = task("new").with_metadata(META_CREATED_AT, "2026-02-01T00:00:00+00:00");
        fs.write_task(&old).await.unwrap();
        fs.write_task(&new).await.unwrap();

        let pending = fs.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].to_string_lossy().ends_with("_new.md"));
    }

    #[tokio::test]
    async fn test_result_placement_and_superseding() {
        let (temp, fs) = setup().await;
        let id = TaskId::new("t1").unwrap();

        let first = fs.write_result(&TaskResult::error(id.clone(), "boom")).await.unwrap();
        assert!(first.starts_with(temp.path().join(RESULTS_ERROR_DIR)));

        let second = fs
            .write_result(&TaskResult::success(id.clone(), "fixed"))
            .await
            .unwrap();
        assert!(second.starts_with(temp.path().join(RESULTS_SUCCESS_DIR)));
        assert!(!first.exists());

        let superseded: Vec<_> = std::fs::read_dir(temp.path().join(RESULTS_ERROR_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("superseded"))
            .collect();
        assert_eq!(superseded.len(), 2);

        let current = fs.read_result(&id).await.unwrap().unwrap();
        assert_eq!(current.summary, "fixed");
        let stats = fs.queue_stats().await.unwrap();
        assert_eq!(stats.results_success, 1);
        assert_eq!(stats.results_error, 0);
    }

    #[tokio::test]
    async fn test_rapid_rewrites_keep_every_superseded_copy() {
        let (temp, fs) = setup().await;
        let id = TaskId::new("t1").unwrap();
        for summary in ["one", "two", "three"] {
            fs.write_result(&TaskResult::error(id.clone(), summary))
                .await
                .unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(temp.path().join(RESULTS_ERROR_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        let superseded_results = names
            .iter()
            .filter(|n| n.contains("superseded") && n.ends_with(".md"))
            .count();
        let superseded_sidecars = names
            .iter()
            .filter(|n| n.contains("superseded") && n.ends_with(".meta.json"))
            .count();
        assert_eq!(superseded_results, 2);
        assert_eq!(superseded_sidecars, 2);
        assert_eq!(fs.read_result(&id).await.unwrap().unwrap().summary, "three");
    }

    #[tokio::test]
    async fn test_path_like_project_never_leaves_the_queue() {
        let (temp, fs) = setup().await;
        let path = temp.path().join(TASKS_PENDING_DIR).join("manual.md");
        std::fs::write(
            &path,
            "## BRIDGE_TASK: analyze\n### Project\n../../../escaped\n### Task\nLook\n### Metadata\n- task_id: m1\n---\n",
        )
        .unwrap();
        let err = fs.read_task(&path).await.unwrap_err();
        assert_eq!(err.kind(), filebridge_core::ErrorKind::Security);

        // A task built in memory is refused at claim time too
        let mut escaped = task("m2");
        escaped.project_id = "../../../escaped".to_string();
        let err = fs.claim_file(&path, &escaped).await.unwrap_err();
        assert_eq!(err.kind(), filebridge_core::ErrorKind::Security);
        assert!(path.exists());
        assert!(!temp.path().join("escaped").exists());
        assert_eq!(fs.list(QueueState::Processing).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_claim_and_touch_refresh_mtime() {
        let (_temp, fs) = setup().await;
        let t = task("t1");
        let path = fs.write_task(&t).await.unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let ClaimOutcome::Claimed(claimed) = fs.claim_file(&path, &t).await.unwrap() else {
            panic!("expected claim");
        };
        let age = |p: &Path| {
            std::fs::metadata(p)
                .unwrap()
                .modified()
                .unwrap()
                .elapsed()
                .unwrap_or_default()
        };
        assert!(age(&claimed) < Duration::from_secs(60));

        std::fs::File::options()
            .write(true)
            .open(&claimed)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(fs.touch_processing(&t.id).await.unwrap());
        assert!(age(&claimed) < Duration::from_secs(60));

        fs.finish(&t.id, TaskStatus::Completed).await.unwrap();
        assert!(!fs.touch_processing(&t.id).await.unwrap());
        assert!(touch(&claimed).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_leaves_active_states_alone() {
        let (temp, fs) = setup().await;
        let t = task("t1").with_priority(Priority::High);
        let pending = fs.write_task(&t).await.unwrap();
        std::fs::write(temp.path().join(TASKS_COMPLETED_DIR).join("done.md"), "x").unwrap();
        fs.write_result(&TaskResult::success(TaskId::new("t0").unwrap(), "ok"))
            .await
            .unwrap();

        let removed = fs.cleanup_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 3);
        assert!(pending.exists());
        assert_eq!(fs.queue_stats().await.unwrap().pending, 1);
    }
}
