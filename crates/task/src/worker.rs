//! Glue between the task manager and the bridge directory
//!
//! [`QueueWorker`] guards and prepares a claimed task before handing it to
//! the pluggable [`TaskExecutor`]; [`QueueObserver`] turns every outcome into
//! a result file and a terminal move, and keeps in-flight claims fresh so the
//! stale-task sweep leaves them alone.

use crate::context::{ProjectContext, ProjectContextLoader};
use crate::executor::{ExecutionObserver, TaskFailure, TaskHandler, TaskOutcome};
use crate::filesystem::{BridgeFileSystem, FinishOutcome};
use async_trait::async_trait;
use filebridge_core::{Error, Result, Task, TaskResult};
use filebridge_utils::PathGuard;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything an executor gets besides the task itself
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Absent when context loading is disabled or failed
    pub project: Option<ProjectContext>,
    /// The task's `Files`, resolved inside the project and already checked
    pub targets: Vec<PathBuf>,
}

/// Performs the actual work for a task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, context: &ExecutionContext) -> Result<TaskResult>;
}

pub struct QueueWorker {
    executor: Arc<dyn TaskExecutor>,
    contexts: ProjectContextLoader,
    guard: PathGuard,
}

impl QueueWorker {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        contexts: ProjectContextLoader,
        guard: PathGuard,
    ) -> Self {
        Self {
            executor,
            contexts,
            guard,
        }
    }
}

#[async_trait]
impl TaskHandler for QueueWorker {
    async fn handle(&self, task: &Task) -> Result<TaskResult> {
        let (root, auto_load) = {
            let registry = self.contexts.registry().read().await;
            let project = registry.get(&task.project_id).ok_or_else(|| {
                Error::configuration(format!("unknown project '{}'", task.project_id))
            })?;
            (
                project.resolved_path(),
                registry.global_settings().auto_load_context,
            )
        };

        // A violation stops here, before the executor sees the task
        let targets = self.guard.check_all(&root, &task.files).map_err(|e| {
            tracing::warn!(task_id = %task.id, error = %e, "task refused by path guard");
            e
        })?;

        let project = if auto_load {
            match self.contexts.load(&task.project_id).await {
                Ok(context) => Some(context),
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        project = %task.project_id,
                        error = %e,
                        "project context unavailable"
                    );
                    None
                }
            }
        } else {
            None
        };

        self.executor
            .execute(task, &ExecutionContext { project, targets })
            .await
    }
}

/// Persists outcomes: result file first, then the terminal move
#[derive(Debug, Clone)]
pub struct QueueObserver {
    fs: BridgeFileSystem,
}

impl QueueObserver {
    pub fn new(fs: BridgeFileSystem) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl ExecutionObserver for QueueObserver {
    async fn on_finished(&self, task: &Task, outcome: &TaskOutcome) {
        let result = match outcome {
            TaskOutcome::Completed(result) => result.clone(),
            TaskOutcome::Failed(failure) => failure.to_result(),
            TaskOutcome::Cancelled => {
                TaskResult::error(task.id.clone(), "cancelled before execution")
            }
        };

        if let Err(e) = self.fs.write_result(&result).await {
            tracing::error!(task_id = %task.id, error = %e, "failed to write task result");
        }

        match self.fs.finish(&task.id, outcome.task_status()).await {
            Ok(FinishOutcome::Moved(path)) => {
                tracing::debug!(task_id = %task.id, path = %path.display(), "task finished");
            }
            Ok(FinishOutcome::Missing) => {
                tracing::warn!(task_id = %task.id, "task file missing from processing");
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "failed to move finished task");
            }
        }
    }

    /// The failed attempt's result is written now; the final one supersedes it
    async fn on_retry(&self, task: &Task, failure: &TaskFailure, attempt: u32) {
        let result = failure
            .to_result()
            .with_next_step(format!("Retrying after failed attempt {attempt}"));
        if let Err(e) = self.fs.write_result(&result).await {
            tracing::warn!(task_id = %task.id, error = %e, "failed to write interim result");
        }
    }

    async fn keep_alive(&self, task: &Task) {
        match self.fs.touch_processing(&task.id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(task_id = %task.id, "no processing file to refresh"),
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to refresh claim"),
        }
    }

    async fn still_claimed(&self, task: &Task) -> bool {
        match self.fs.processing_path(&task.id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "claim check failed; running anyway");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{ClaimOutcome, QueueState};
    use filebridge_cache::CacheManager;
    use filebridge_config::ProjectRegistry;
    use filebridge_core::{ErrorKind, ResultStatus, TaskId, TaskKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, task: &Task, context: &ExecutionContext) -> Result<TaskResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let notes = context
                .project
                .as_ref()
                .and_then(|p| p.notes.clone())
                .unwrap_or_default();
            Ok(TaskResult::success(task.id.clone(), format!("saw {notes}")))
        }
    }

    async fn worker(temp: &TempDir, executor: Arc<CountingExecutor>) -> QueueWorker {
        let project_dir = temp.path().join("tech");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("README.md"), "notes").unwrap();
        std::fs::write(project_dir.join("big.rs"), vec![b'x'; 64]).unwrap();

        let registry_path = temp.path().join("projects.json");
        let document = json!({
            "projects": { "tech": { "shortcut": "[tech]", "path": project_dir.to_string_lossy() } }
        });
        std::fs::write(&registry_path, document.to_string()).unwrap();
        let mut registry = ProjectRegistry::new(&registry_path);
        registry.load().await.unwrap();

        let cache = CacheManager::new(temp.path().join("cache"), Duration::from_secs(60));
        let contexts = ProjectContextLoader::new(Arc::new(RwLock::new(registry)), cache);
        QueueWorker::new(executor, contexts, PathGuard::new(32, ["rs"]))
    }

    #[tokio::test]
    async fn test_worker_passes_context_to_executor() {
        let temp = TempDir::new().unwrap();
        let executor = Arc::new(CountingExecutor::default());
        let worker = worker(&temp, Arc::clone(&executor)).await;

        let task = Task::new("tech", TaskKind::Analyze, "look").with_file("src/new.rs");
        let result = worker.handle(&task).await.unwrap();
        assert_eq!(result.summary, "saw notes");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_security_violation_never_reaches_executor() {
        let temp = TempDir::new().unwrap();
        let executor = Arc::new(CountingExecutor::default());
        let worker = worker(&temp, Arc::clone(&executor)).await;

        for file in ["../outside.rs", "notes.exe", "big.rs"] {
            let task = Task::new("tech", TaskKind::Implement, "edit").with_file(file);
            let err = worker.handle(&task).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Security, "{file}");
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let unknown = Task::new("nope", TaskKind::Implement, "edit");
        assert_eq!(
            worker.handle(&unknown).await.unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[tokio::test]
    async fn test_observer_writes_result_and_moves_task() {
        let temp = TempDir::new().unwrap();
        let fs = BridgeFileSystem::new(temp.path());
        fs.initialize_structure().await.unwrap();
        let observer = QueueObserver::new(fs.clone());

        let task = Task::new("tech", TaskKind::Test, "run").with_id(TaskId::new("t9").unwrap());
        let path = fs.write_task(&task).await.unwrap();
        assert!(matches!(
            fs.claim_file(&path, &task).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        observer.on_finished(&task, &TaskOutcome::Cancelled).await;

        let result = fs.read_result(&task.id).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(
            fs.locate(&task.id).await.unwrap().map(|(s, _)| s),
            Some(QueueState::Error)
        );
    }

    #[tokio::test]
    async fn test_claim_checks_follow_the_processing_file() {
        let temp = TempDir::new().unwrap();
        let fs = BridgeFileSystem::new(temp.path());
        fs.initialize_structure().await.unwrap();
        let observer = QueueObserver::new(fs.clone());

        let task = Task::new("tech", TaskKind::Test, "run").with_id(TaskId::new("t7").unwrap());
        let path = fs.write_task(&task).await.unwrap();
        assert!(!observer.still_claimed(&task).await);
        let ClaimOutcome::Claimed(claimed) = fs.claim_file(&path, &task).await.unwrap() else {
            panic!("expected claim");
        };
        assert!(observer.still_claimed(&task).await);

        let old = std::time::SystemTime::now() - Duration::from_secs(7_200);
        std::fs::File::options()
            .write(true)
            .open(&claimed)
            .unwrap()
            .set_modified(old)
            .unwrap();
        observer.keep_alive(&task).await;
        let age = std::fs::metadata(&claimed)
            .unwrap()
            .modified()
            .unwrap()
            .elapsed()
            .unwrap_or_default();
        assert!(age < Duration::from_secs(60));

        // The stale sweep moved it on; nothing may run it now
        fs.finish(&task.id, filebridge_core::TaskStatus::Error)
            .await
            .unwrap();
        assert!(!observer.still_claimed(&task).await);
    }

    #[tokio::test]
    async fn test_retry_result_is_superseded_by_final_result() {
        let temp = TempDir::new().unwrap();
        let fs = BridgeFileSystem::new(temp.path());
        fs.initialize_structure().await.unwrap();
        let observer = QueueObserver::new(fs.clone());

        let task = Task::new("tech", TaskKind::Test, "run").with_id(TaskId::new("t8").unwrap());
        let path = fs.write_task(&task).await.unwrap();
        fs.claim_file(&path, &task).await.unwrap();

        let failure = TaskFailure::new(
            task.id.clone(),
            crate::executor::FailureReason::Handler,
            "transient",
        );
        observer.on_retry(&task, &failure, 1).await;
        let interim = fs.read_result(&task.id).await.unwrap().unwrap();
        assert_eq!(interim.status, ResultStatus::Error);
        assert!(interim.next_steps.iter().any(|s| s.contains("attempt 1")));

        let done = TaskOutcome::Completed(TaskResult::success(task.id.clone(), "fine"));
        observer.on_finished(&task, &done).await;

        let current = fs.read_result(&task.id).await.unwrap().unwrap();
        assert_eq!(current.summary, "fine");
        let superseded = std::fs::read_dir(fs.results_dir(ResultStatus::Error))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.contains("superseded") && name.ends_with(".md")
            })
            .count();
        assert_eq!(superseded, 1);
        assert_eq!(
            fs.locate(&task.id).await.unwrap().map(|(s, _)| s),
            Some(QueueState::Completed)
        );
    }
}
