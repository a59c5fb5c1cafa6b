//! Diagnosis and repair of a bridge root
//!
//! [`RecoveryManager::diagnose`] only reads. [`RecoveryManager::auto_fix`]
//! touches the tree only for the findings it is handed, so a healthy tree
//! sees no writes at all.

use crate::findings::{ConfigFile, DiagnosticReport, Finding, FindingKind};
use crate::log::{RecoveryLog, RecoveryRecord};
use chrono::{DateTime, Utc};
use filebridge_config::{config_path, BridgeConfig, RegistryDocument};
use filebridge_core::constants::{CONFIG_DIR, LOGS_DIR, RECOVERY_LOG_FILENAME, REQUIRED_DIRS};
use filebridge_core::{Error, Result, TaskResult, TaskStatus};
use filebridge_task::{BridgeFileSystem, QueueState};
use filebridge_utils::tracing as events;
use filebridge_utils::write_atomic_async;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use walkdir::WalkDir;

/// What one `auto_fix` call did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Findings handed in that cannot be repaired automatically
    pub skipped: usize,
    pub actions: Vec<RecoveryRecord>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub runs: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug)]
pub struct RecoveryManager {
    root: PathBuf,
    fs: BridgeFileSystem,
    log: RecoveryLog,
    stale_after: Duration,
    counters: Counters,
}

impl RecoveryManager {
    /// `stale_after` is how long a task may sit in `tasks/processing` before
    /// it counts as stranded
    pub fn new(root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        let root = root.into();
        Self {
            fs: BridgeFileSystem::new(&root),
            log: RecoveryLog::new(root.join(LOGS_DIR).join(RECOVERY_LOG_FILENAME)),
            root,
            stale_after,
            counters: Counters::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log(&self) -> &RecoveryLog {
        &self.log
    }

    fn config_file_path(&self, file: ConfigFile) -> PathBuf {
        match file {
            ConfigFile::Bridge => config_path(&self.root),
            ConfigFile::Projects => self.root.join(CONFIG_DIR).join(file.file_name()),
        }
    }

    /// Inspect the tree without modifying it
    pub async fn diagnose(&self) -> Result<DiagnosticReport> {
        let mut findings = Vec::new();

        for dir in REQUIRED_DIRS {
            let path = self.root.join(dir);
            if !is_dir(&path).await {
                findings.push(Finding::missing_directory(path));
            }
        }

        for file in ConfigFile::ALL {
            if let Some(finding) = self.check_config(file).await {
                findings.push(finding);
            }
        }

        findings.extend(self.check_permissions().await);
        findings.extend(self.check_stale_tasks().await?);

        let report = DiagnosticReport::new(self.root.clone(), findings);
        if report.healthy {
            tracing::debug!(root = %self.root.display(), "bridge tree healthy");
        } else {
            tracing::warn!(
                root = %self.root.display(),
                findings = report.findings.len(),
                "bridge tree needs attention"
            );
        }
        Ok(report)
    }

    async fn check_config(&self, file: ConfigFile) -> Option<Finding> {
        let path = self.config_file_path(file);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Some(Finding::missing_config(file, path));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Some(Finding::insufficient_permissions(path, e));
            }
            // Unreadable bytes (bad UTF-8) are as good as corrupt
            Err(e) => return Some(Finding::corrupt_config(file, path, e.to_string())),
        };

        let parsed = match file {
            ConfigFile::Bridge => BridgeConfig::from_json(&raw).map(|_| ()),
            ConfigFile::Projects => serde_json::from_str::<RegistryDocument>(&raw)
                .map(|_| ())
                .map_err(Error::from),
        };
        parsed
            .err()
            .map(|e| Finding::corrupt_config(file, path, e.to_string()))
    }

    /// Read-only directories and unreadable entries near the root
    async fn check_permissions(&self) -> Vec<Finding> {
        let root = self.root.clone();
        let scan = tokio::task::spawn_blocking(move || {
            let mut findings = Vec::new();
            if !root.exists() {
                return findings;
            }
            for entry in WalkDir::new(&root).max_depth(2) {
                match entry {
                    Ok(entry) if entry.file_type().is_dir() => {
                        let readonly = entry
                            .metadata()
                            .map(|m| m.permissions().readonly())
                            .unwrap_or(false);
                        if readonly {
                            findings.push(Finding::insufficient_permissions(
                                entry.path().to_path_buf(),
                                "directory is read-only",
                            ));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let denied = e
                            .io_error()
                            .is_some_and(|io| io.kind() == std::io::ErrorKind::PermissionDenied);
                        if denied {
                            let path =
                                e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                            findings.push(Finding::insufficient_permissions(path, e));
                        }
                    }
                }
            }
            findings
        });

        match scan.await {
            Ok(findings) => findings,
            Err(e) => {
                tracing::warn!(error = %e, "permission scan did not complete");
                Vec::new()
            }
        }
    }

    async fn check_stale_tasks(&self) -> Result<Vec<Finding>> {
        let now = SystemTime::now();
        let mut findings = Vec::new();
        for path in self.fs.list(QueueState::Processing).await? {
            let Ok(modified) = tokio::fs::metadata(&path).await.and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.stale_after {
                findings.push(Finding::stale_processing(path, age.as_secs()));
            }
        }
        Ok(findings)
    }

    /// Apply every auto-fixable finding, directories first, then default
    /// configuration, then corrupt configuration, then stranded tasks.
    /// Each attempt is appended to the recovery log.
    pub async fn auto_fix(&self, findings: &[Finding]) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let mut fixable: Vec<&Finding> = Vec::new();
        for finding in findings {
            if finding.auto_fixable {
                fixable.push(finding);
            } else {
                report.skipped += 1;
                tracing::warn!(finding = %finding.description, "finding needs an operator");
            }
        }
        fixable.sort_by_key(|f| f.kind.fix_rank());

        for finding in fixable {
            let (action, result) = self.apply(&finding.kind).await;
            let record = RecoveryRecord::new(action, finding.kind.path(), &result);
            let success = result.is_ok();

            events::recovery_action(action, &record.target, success);
            if let Err(e) = &result {
                tracing::warn!(action, error = %e, "recovery action failed");
            }
            if let Err(e) = self.log.append(&record).await {
                tracing::error!(error = %e, "failed to append recovery log");
            }

            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            report.attempted += 1;
            if success {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                report.succeeded += 1;
            } else {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                report.failed += 1;
            }
            report.actions.push(record);
        }
        report
    }

    async fn apply(&self, kind: &FindingKind) -> (&'static str, Result<()>) {
        match kind {
            FindingKind::MissingDirectory { path } => (
                "create_directory",
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|e| Error::file_system(path, "create directory", e)),
            ),
            FindingKind::MissingConfig { file, path } => {
                // Someone may have written it since the diagnosis
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return ("write_default_config", Ok(()));
                }
                ("write_default_config", write_default_config(*file, path).await)
            }
            FindingKind::CorruptConfig { file, path, .. } => {
                ("replace_corrupt_config", replace_corrupt_config(*file, path).await)
            }
            FindingKind::StaleProcessingTask { path, age_secs } => {
                ("fail_stale_task", self.fail_stale_task(path, *age_secs).await)
            }
            FindingKind::InsufficientPermissions { path } => (
                "fix_permissions",
                Err(Error::security(
                    path.clone(),
                    "permissions must be fixed by an operator",
                )),
            ),
        }
    }

    /// Record an error result for a stranded task and move it to `tasks/error`
    async fn fail_stale_task(&self, path: &Path, age_secs: u64) -> Result<()> {
        match self.fs.read_task(path).await {
            Ok(task) => {
                let result = TaskResult::error(
                    task.id.clone(),
                    format!("task stranded in processing for {age_secs}s"),
                )
                .with_next_step("Resubmit the task if it is still needed");
                self.fs.write_result(&result).await?;
                self.fs.finish(&task.id, TaskStatus::Error).await?;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "stranded task unreadable");
                self.fs.move_to(path, QueueState::Error).await?;
            }
        }
        Ok(())
    }

    /// Diagnose, then repair whatever was found
    pub async fn run_once(&self) -> Result<(DiagnosticReport, RecoveryReport)> {
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        *self.counters.last_run.lock() = Some(Utc::now());

        let diagnostic = self.diagnose().await?;
        let report = if diagnostic.healthy {
            RecoveryReport::default()
        } else {
            self.auto_fix(&diagnostic.findings).await
        };
        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "recovery pass finished"
            );
        }
        Ok((diagnostic, report))
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        RecoveryStatistics {
            runs: self.counters.runs.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            last_run: *self.counters.last_run.lock(),
        }
    }

    /// Run [`Self::run_once`] every `interval` until `shutdown` flips to true
    pub fn run_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; startup already ran a pass
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "periodic recovery failed");
                        }
                    }
                }
            }
            tracing::debug!("periodic recovery stopped");
        })
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn write_default_config(file: ConfigFile, path: &Path) -> Result<()> {
    let raw = match file {
        ConfigFile::Bridge => BridgeConfig::default().to_json()?,
        ConfigFile::Projects => serde_json::to_string_pretty(&RegistryDocument::default())?,
    };
    write_atomic_async(path, raw.as_bytes()).await
}

/// Keep the corrupt file as `<name>.corrupt-<stamp>` and write a default
async fn replace_corrupt_config(file: ConfigFile, path: &Path) -> Result<()> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let snapshot = path.with_file_name(format!("{}.corrupt-{stamp}", file.file_name()));
    tokio::fs::rename(path, &snapshot)
        .await
        .map_err(|e| Error::file_system(path, "snapshot corrupt configuration", e))?;
    tracing::info!(
        path = %path.display(),
        snapshot = %snapshot.display(),
        "corrupt configuration set aside"
    );
    write_default_config(file, path).await
}
