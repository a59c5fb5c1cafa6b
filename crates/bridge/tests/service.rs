use async_trait::async_trait;
use filebridge::{BridgeService, ExecutionContext, Result, Task, TaskExecutor, TaskResult};
use filebridge_config::BridgeConfig;
use filebridge_core::{Priority, ResultStatus, TaskId, TaskKind};
use filebridge_task::{BridgeFileSystem, QueueState};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingExecutor {
    calls: AtomicUsize,
    delay: Duration,
}

impl RecordingExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: &Task, context: &ExecutionContext) -> Result<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let project = context
            .project
            .as_ref()
            .map(|p| p.project.id.clone())
            .unwrap_or_default();
        Ok(TaskResult::success(
            task.id.clone(),
            format!("handled {} for {project}", task.kind),
        ))
    }
}

fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.settings.worker_count = 2;
    config.settings.scan_interval_ms = 100;
    config.settings.auto_cleanup = false;
    config.settings.recovery_interval_secs = 0;
    config.settings.execution_timeout_secs = 10;
    config
}

/// A bridge root with one registered project, `tech`
fn prepare_root(temp: &TempDir) -> std::path::PathBuf {
    let root = temp.path().join("bridge");
    let project = temp.path().join("tech");
    std::fs::create_dir_all(root.join("config")).unwrap();
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("README.md"), "# tech").unwrap();

    let registry = json!({
        "version": "1.0.0",
        "projects": {
            "tech": { "shortcut": "[tech]", "name": "Tech", "path": project.to_string_lossy() }
        }
    });
    std::fs::write(root.join("config/projects.json"), registry.to_string()).unwrap();
    root
}

async fn start(root: &Path, executor: Arc<RecordingExecutor>) -> BridgeService {
    BridgeService::builder()
        .root(root)
        .config(test_config())
        .executor(executor)
        .settle_window(Duration::ZERO)
        .start()
        .await
        .unwrap()
}

async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn task(id: &str) -> Task {
    Task::new("tech", TaskKind::Analyze, "Summarise the module layout")
        .with_id(TaskId::new(id).unwrap())
        .with_title("Layout summary")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_high_priority_task_yields_result() {
    let temp = TempDir::new().unwrap();
    let root = prepare_root(&temp);
    let executor = Arc::new(RecordingExecutor::default());
    let service = start(&root, Arc::clone(&executor)).await;

    let fs = service.filesystem().clone();
    let task = task("e2e-high").with_priority(Priority::High);
    fs.write_task(&task).await.unwrap();

    let id = task.id.clone();
    let done = eventually(Duration::from_secs(10), || {
        let fs = fs.clone();
        let id = id.clone();
        async move { matches!(fs.read_result(&id).await, Ok(Some(_))) }
    })
    .await;
    assert!(done, "no result within the execution timeout");

    let result = fs.read_result(&task.id).await.unwrap().unwrap();
    assert!(matches!(result.status, ResultStatus::Success | ResultStatus::Error));
    assert_eq!(result.summary, "handled analyze for tech");

    let moved = eventually(Duration::from_secs(5), || {
        let fs = fs.clone();
        let id = id.clone();
        async move {
            matches!(
                fs.locate(&id).await,
                Ok(Some((QueueState::Completed | QueueState::Error, _)))
            )
        }
    })
    .await;
    assert!(moved, "task file did not reach a terminal directory");
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    service.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_without_task_section_is_quarantined() {
    let temp = TempDir::new().unwrap();
    let root = prepare_root(&temp);
    let executor = Arc::new(RecordingExecutor::default());
    let service = start(&root, Arc::clone(&executor)).await;

    let broken = "## BRIDGE_TASK: analyze\n\n### Title\nBroken\n\n### Project\ntech\n\n### Priority\nhigh\n\n---\n";
    let name = "tech_20260101T000000_broken.md";
    std::fs::write(root.join("tasks/pending").join(name), broken).unwrap();

    let quarantined = root.join("tasks/quarantine").join(name);
    let parked = eventually(Duration::from_secs(10), || {
        let quarantined = quarantined.clone();
        async move { quarantined.exists() }
    })
    .await;
    assert!(parked, "invalid task file was not quarantined");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    let id = TaskId::new("broken").unwrap();
    assert!(service.filesystem().read_result(&id).await.unwrap().is_none());

    service.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependent_task_runs_after_its_dependency() {
    let temp = TempDir::new().unwrap();
    let root = prepare_root(&temp);
    let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(150)));
    let service = start(&root, Arc::clone(&executor)).await;
    let fs = service.filesystem().clone();

    let first = task("dep-first");
    let second = task("dep-second").with_dependency(first.id.clone());
    fs.write_task(&second).await.unwrap();
    fs.write_task(&first).await.unwrap();

    let ids = [first.id.clone(), second.id.clone()];
    let done = eventually(Duration::from_secs(15), || {
        let fs = fs.clone();
        let ids = ids.clone();
        async move {
            for id in &ids {
                if !matches!(fs.read_result(id).await, Ok(Some(_))) {
                    return false;
                }
            }
            true
        }
    })
    .await;
    assert!(done);

    let a = fs.read_result(&first.id).await.unwrap().unwrap();
    let b = fs.read_result(&second.id).await.unwrap().unwrap();
    assert_eq!(b.status, ResultStatus::Success);
    assert!(b.metrics.started_at >= a.metrics.completed_at);

    service.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_bridges_on_one_root_run_each_task_once() {
    let temp = TempDir::new().unwrap();
    let root = prepare_root(&temp);
    let left_exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(20)));
    let right_exec = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(20)));
    let left = start(&root, Arc::clone(&left_exec)).await;
    let right = start(&root, Arc::clone(&right_exec)).await;

    let fs = BridgeFileSystem::new(&root);
    let ids: Vec<TaskId> = (0..6)
        .map(|n| TaskId::new(format!("shared-{n}")).unwrap())
        .collect();
    for id in &ids {
        fs.write_task(&task(id.as_str())).await.unwrap();
    }

    let done = eventually(Duration::from_secs(15), || {
        let fs = fs.clone();
        let ids = ids.clone();
        async move {
            for id in &ids {
                if !matches!(fs.locate(id).await, Ok(Some((QueueState::Completed, _)))) {
                    return false;
                }
            }
            true
        }
    })
    .await;
    assert!(done, "not every task completed");

    let total = left_exec.calls.load(Ordering::SeqCst) + right_exec.calls.load(Ordering::SeqCst);
    assert_eq!(total, ids.len());

    left.shutdown(true).await;
    right.shutdown(true).await;
}

#[tokio::test]
async fn test_health_report_after_startup() {
    let temp = TempDir::new().unwrap();
    let root = prepare_root(&temp);
    let service = start(&root, Arc::new(RecordingExecutor::default())).await;

    let health = service.health().await.unwrap();
    assert!(health.diagnostic.healthy, "{:?}", health.diagnostic.findings);
    assert!(health.is_healthy());
    assert_eq!(health.queue.pending, 0);

    let value = serde_json::to_value(&health).unwrap();
    assert!(value["cache"]["hit_rate"].is_number());
    assert!(value["recovery"]["runs"].is_number());

    service.shutdown(false).await;
}

#[tokio::test]
async fn test_missing_executor_is_configuration_error() {
    let temp = TempDir::new().unwrap();
    let err = BridgeService::builder()
        .root(temp.path())
        .start()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), filebridge::ErrorKind::Configuration);
}
