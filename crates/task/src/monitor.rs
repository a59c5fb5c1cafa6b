//! Discovery of new task files in `tasks/pending`
//!
//! Filesystem notifications give low latency; a periodic scan catches
//! anything the watcher missed (or everything, when no watcher could be
//! started). The monitor only parses and claims. Claimed tasks go to the
//! execution layer through a channel.

use crate::filesystem::{BridgeFileSystem, ClaimOutcome, FinishOutcome, QueueState};
use crate::protocol::{is_task_file_name, parse_task};
use filebridge_core::{Error, Result, Task, TaskId, TaskStatus};
use filebridge_utils::tracing as events;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};

/// What happened to one pending file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDisposition {
    Queued(TaskId),
    /// Another claimer moved it first
    AlreadyClaimed,
    Quarantined,
    /// Unparseable but still being written; retried on a later pass
    Deferred,
    /// Not a task file, already handled, or gone
    Ignored,
}

enum Prepared {
    Ready(Task),
    Invalid(Error),
    Gone,
}

pub struct TaskMonitor {
    fs: BridgeFileSystem,
    scan_interval: Duration,
    settle: Duration,
    seen: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("root", &self.fs.root())
            .field("scan_interval", &self.scan_interval)
            .field("settle", &self.settle)
            .finish()
    }
}

fn start_watcher(dir: &Path, tx: mpsc::Sender<PathBuf>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        if tx.blocking_send(path).is_err() {
                            // Monitor stopped
                            return;
                        }
                    }
                }
            }
        },
        Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

impl TaskMonitor {
    pub fn new(fs: BridgeFileSystem, scan_interval: Duration) -> Self {
        Self {
            fs,
            scan_interval,
            settle: Duration::from_secs(2),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// How long an unparseable file may keep changing before it is
    /// quarantined
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Watch and scan until `shutdown` flips or the receiver goes away
    pub async fn run(
        self: Arc<Self>,
        tx: mpsc::Sender<Task>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let pending = self.fs.state_dir(QueueState::Pending);
        let (event_tx, mut event_rx) = mpsc::channel::<PathBuf>(256);
        let _watcher = match start_watcher(&pending, event_tx) {
            Ok(watcher) => {
                tracing::info!(path = %pending.display(), "watching for task files");
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(
                    path = %pending.display(),
                    error = %e,
                    "file watcher unavailable, relying on periodic scans"
                );
                None
            }
        };

        let mut interval = tokio::time::interval(self.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() || tx.is_closed() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once(&tx).await {
                        tracing::warn!(error = %e, "pending scan failed");
                    }
                }
                Some(path) = event_rx.recv() => {
                    if let Err(e) = self.process_file(&path, &tx).await {
                        tracing::warn!(path = %path.display(), error = %e, "failed to process task file");
                    }
                }
            }
        }

        tracing::info!("task monitor stopped");
        Ok(())
    }

    /// Process everything currently pending: higher priority first, then
    /// oldest first. Returns how many tasks were queued.
    pub async fn scan_once(&self, tx: &mpsc::Sender<Task>) -> Result<usize> {
        let mut files = self.fs.list_pending().await?;
        files.reverse();
        {
            let present: HashSet<&PathBuf> = files.iter().collect();
            self.seen.lock().retain(|p| present.contains(p));
        }

        let mut ready = Vec::new();
        for path in files {
            if self.seen.lock().contains(&path) {
                continue;
            }
            match self.prepare(&path).await? {
                Prepared::Ready(task) => ready.push((path, task)),
                Prepared::Invalid(e) => {
                    self.reject(&path, e).await?;
                }
                Prepared::Gone => {}
            }
        }
        // Stable sort keeps oldest-first within a priority
        ready.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority));

        let mut queued = 0;
        for (path, task) in ready {
            if let FileDisposition::Queued(_) = self.dispatch(&path, task, tx).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Handle one pending file
    pub async fn process_file(
        &self,
        path: &Path,
        tx: &mpsc::Sender<Task>,
    ) -> Result<FileDisposition> {
        let in_pending = path.parent() == Some(self.fs.state_dir(QueueState::Pending).as_path());
        let is_task = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_task_file_name);
        if !in_pending || !is_task || self.seen.lock().contains(path) {
            return Ok(FileDisposition::Ignored);
        }

        match self.prepare(path).await? {
            Prepared::Ready(task) => self.dispatch(path, task, tx).await,
            Prepared::Invalid(e) => self.reject(path, e).await,
            Prepared::Gone => Ok(FileDisposition::Ignored),
        }
    }

    async fn prepare(&self, path: &Path) -> Result<Prepared> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Prepared::Gone),
            Err(e) => return Err(Error::file_system(path, "read task file", e)),
        };
        match parse_task(&text, path).and_then(|task| task.validate().map(|()| task)) {
            Ok(task) => Ok(Prepared::Ready(task)),
            Err(e) => Ok(Prepared::Invalid(e)),
        }
    }

    async fn reject(&self, path: &Path, error: Error) -> Result<FileDisposition> {
        if self.recently_modified(path).await {
            tracing::debug!(path = %path.display(), error = %error, "task file not ready yet");
            return Ok(FileDisposition::Deferred);
        }
        tracing::warn!(
            path = %path.display(),
            error = %error,
            "invalid task file moved to quarantine"
        );
        self.fs.quarantine(path).await?;
        self.seen.lock().insert(path.to_path_buf());
        Ok(FileDisposition::Quarantined)
    }

    async fn dispatch(
        &self,
        path: &Path,
        mut task: Task,
        tx: &mpsc::Sender<Task>,
    ) -> Result<FileDisposition> {
        match self.fs.claim_file(path, &task).await? {
            ClaimOutcome::AlreadyClaimed => Ok(FileDisposition::AlreadyClaimed),
            ClaimOutcome::Claimed(_) => {
                self.seen.lock().insert(path.to_path_buf());
                task.transition_to(TaskStatus::Processing)?;
                events::task_queued(task.id.as_str(), &task.project_id, task.priority.as_str());
                let id = task.id.clone();
                if tx.send(task).await.is_err() {
                    self.hand_back(path, &id).await;
                    return Err(Error::execution(id.as_str(), "execution queue closed"));
                }
                Ok(FileDisposition::Queued(id))
            }
        }
    }

    /// Undo a claim nobody will execute
    async fn hand_back(&self, path: &Path, id: &TaskId) {
        match self.fs.release(id).await {
            Ok(FinishOutcome::Moved(back)) => {
                self.seen.lock().remove(path);
                tracing::warn!(
                    task_id = %id,
                    path = %back.display(),
                    "execution queue closed; task returned to pending"
                );
            }
            Ok(FinishOutcome::Missing) => {
                tracing::warn!(task_id = %id, "execution queue closed; claimed file already gone");
            }
            Err(e) => {
                tracing::error!(
                    task_id = %id,
                    error = %e,
                    "execution queue closed; task left in processing"
                );
            }
        }
    }

    async fn recently_modified(&self, path: &Path) -> bool {
        if self.settle.is_zero() {
            return false;
        }
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age < self.settle)
                .unwrap_or(true),
            Err(_) => false,
        }
    }
}
