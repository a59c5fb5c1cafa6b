//! The running bridge: startup, background loops and shutdown

use crate::health::HealthReport;
use chrono::Utc;
use filebridge_cache::CacheManager;
use filebridge_config::{BridgeConfig, BridgeSettings, ConfigLoader, ProjectRegistry};
use filebridge_core::constants::CACHE_DIR;
use filebridge_core::{Error, ErrorKind, Result, Task, TaskResult, TaskStatus};
use filebridge_recovery::RecoveryManager;
use filebridge_task::{
    AsyncTaskManager, BridgeFileSystem, DependencyTracker, ExecutorConfig, ProjectContextLoader,
    QueueObserver, QueueWorker, TaskExecutor, TaskMonitor,
};
use filebridge_utils::{tracing as events, PathGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Claimed tasks buffered between the monitor and the task manager
const QUEUE_CAPACITY: usize = 256;

/// Upper bound between two retention sweeps
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
pub struct BridgeServiceBuilder {
    root: Option<PathBuf>,
    config: Option<BridgeConfig>,
    executor: Option<Arc<dyn TaskExecutor>>,
    settle: Option<Duration>,
    install_tracing: bool,
}

impl std::fmt::Debug for BridgeServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServiceBuilder")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("has_executor", &self.executor.is_some())
            .field("settle", &self.settle)
            .finish()
    }
}

impl BridgeServiceBuilder {
    /// Bridge root; defaults to `FILEBRIDGE_ROOT`, then `./bridge_data`
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Use this configuration instead of `config/bridge_config.json`
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// How long an unparseable pending file may keep changing before it is
    /// quarantined
    pub fn settle_window(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }

    /// Install the global tracing subscriber at the configured `log_level`
    pub fn install_tracing(mut self) -> Self {
        self.install_tracing = true;
        self
    }

    pub async fn start(self) -> Result<BridgeService> {
        let executor = self
            .executor
            .ok_or_else(|| Error::configuration("no task executor configured"))?;

        let mut loader = ConfigLoader::new();
        if let Some(root) = self.root {
            loader = loader.root(root);
        }
        let root = loader.resolve_root()?;
        let config = match self.config {
            Some(config) => config,
            None => load_config(&root).await?,
        };
        let settings = config.settings.clone();

        if self.install_tracing {
            if let Err(e) = events::init(&settings.log_level) {
                tracing::debug!(error = %e, "tracing subscriber already installed");
            }
        }

        let recovery = Arc::new(RecoveryManager::new(&root, settings.stale_processing()));
        let (diagnostic, repaired) = recovery.run_once().await?;
        if !repaired.is_clean() {
            tracing::warn!(
                findings = diagnostic.findings.len(),
                failed = repaired.failed,
                skipped = repaired.skipped,
                "bridge tree not fully repaired at startup"
            );
        }

        let fs = BridgeFileSystem::new(&root);
        fs.initialize_structure().await?;

        let mut registry = ProjectRegistry::for_root(&root);
        registry.load().await?;
        for warning in registry.validate() {
            tracing::warn!(warning = %warning, "project registry");
        }

        let cache = CacheManager::new(root.join(CACHE_DIR), settings.cache_default_ttl());
        cache.start_cleanup_task(settings.cache_cleanup_interval());
        let contexts = ProjectContextLoader::new(Arc::new(RwLock::new(registry)), cache.clone());

        let guard = PathGuard::new(settings.max_file_size_bytes, &settings.allowed_extensions);
        let worker = QueueWorker::new(executor, contexts.clone(), guard);
        let tracker = Arc::new(DependencyTracker::new(Some(fs.clone())));
        let manager = AsyncTaskManager::new(
            Arc::new(worker),
            ExecutorConfig::from_settings(&settings),
            tracker,
            Some(Arc::new(QueueObserver::new(fs.clone()))),
        );

        let mut monitor = TaskMonitor::new(fs.clone(), settings.scan_interval());
        if let Some(settle) = self.settle {
            monitor = monitor.with_settle(settle);
        }
        let monitor = Arc::new(monitor);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (task_tx, task_rx) = mpsc::channel(QUEUE_CAPACITY);

        let monitor_handle = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let shutdown = shutdown_rx.clone();
            async move {
                if let Err(e) = monitor.run(task_tx, shutdown).await {
                    tracing::error!(error = %e, "task monitor failed");
                }
            }
        });
        let consumer_handle = tokio::spawn(consume(manager.clone(), fs.clone(), task_rx));

        let mut background = Vec::new();
        if settings.auto_cleanup {
            background.push(spawn_retention(fs.clone(), &settings, shutdown_rx.clone()));
        }
        if !settings.recovery_interval().is_zero() {
            background.push(
                Arc::clone(&recovery)
                    .run_periodic(settings.recovery_interval(), shutdown_rx.clone()),
            );
        }

        tracing::info!(
            root = %root.display(),
            workers = settings.worker_count,
            "bridge started"
        );

        Ok(BridgeService {
            root,
            config,
            fs,
            cache,
            contexts,
            manager,
            recovery,
            shutdown_tx,
            monitor_handle,
            consumer_handle,
            background,
        })
    }
}

/// Read the bridge configuration, repairing a corrupt file once
async fn load_config(root: &Path) -> Result<BridgeConfig> {
    match ConfigLoader::new().root(root).load().await {
        Ok(loaded) => Ok(loaded.config),
        Err(e) if e.kind() == ErrorKind::Configuration => {
            tracing::warn!(error = %e, "bridge configuration unusable, running recovery");
            let stale = BridgeSettings::default().stale_processing();
            RecoveryManager::new(root, stale).run_once().await?;
            Ok(ConfigLoader::new().root(root).load().await?.config)
        }
        Err(e) => Err(e),
    }
}

/// Hand every claimed task to the manager. The observer persists outcomes,
/// so handles are not kept.
async fn consume(manager: AsyncTaskManager, fs: BridgeFileSystem, mut rx: mpsc::Receiver<Task>) {
    while let Some(task) = rx.recv().await {
        let id = task.id.clone();
        if let Err(e) = manager.submit(task) {
            tracing::warn!(task_id = %id, error = %e, "task rejected");
            let result = TaskResult::error(id.clone(), e.to_string());
            if let Err(e) = fs.write_result(&result).await {
                tracing::error!(task_id = %id, error = %e, "failed to write task result");
            }
            if let Err(e) = fs.finish(&id, TaskStatus::Error).await {
                tracing::error!(task_id = %id, error = %e, "failed to move rejected task");
            }
        }
    }
}

fn spawn_retention(
    fs: BridgeFileSystem,
    settings: &BridgeSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let retention = settings.retention();
    let every = retention.min(RETENTION_SWEEP_INTERVAL).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match fs.cleanup_older_than(retention).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "expired tasks and results removed"),
                        Err(e) => tracing::warn!(error = %e, "retention cleanup failed"),
                    }
                }
            }
        }
    })
}

pub struct BridgeService {
    root: PathBuf,
    config: BridgeConfig,
    fs: BridgeFileSystem,
    cache: CacheManager,
    contexts: ProjectContextLoader,
    manager: AsyncTaskManager,
    recovery: Arc<RecoveryManager>,
    shutdown_tx: watch::Sender<bool>,
    monitor_handle: JoinHandle<()>,
    consumer_handle: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeService")
            .field("root", &self.root)
            .field("manager", &self.manager)
            .finish()
    }
}

impl BridgeService {
    pub fn builder() -> BridgeServiceBuilder {
        BridgeServiceBuilder::default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn filesystem(&self) -> &BridgeFileSystem {
        &self.fs
    }

    pub fn contexts(&self) -> &ProjectContextLoader {
        &self.contexts
    }

    pub fn manager(&self) -> &AsyncTaskManager {
        &self.manager
    }

    /// Re-read `config/projects.json` and forget memoized project contexts
    pub async fn reload_projects(&self) -> Result<()> {
        let ids: Vec<String> = {
            let mut registry = self.contexts.registry().write().await;
            let before: Vec<String> = registry.list(false).iter().map(|p| p.id.clone()).collect();
            registry.reload().await?;
            before
        };
        for id in ids {
            self.contexts.invalidate(&id).await?;
        }
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            generated_at: Utc::now(),
            diagnostic: self.recovery.diagnose().await?,
            cache: self.cache.statistics(),
            queue: self.fs.queue_stats().await?,
            executor: self.manager.statistics(),
            recovery: self.recovery.statistics(),
        })
    }

    /// Stop discovering work, hand every claimed task to the manager, then
    /// run (`drain`) or cancel what is still queued
    pub async fn shutdown(self, drain: bool) {
        tracing::info!(drain, "bridge shutting down");
        let _ = self.shutdown_tx.send(true);

        // The consumer ends once the monitor drops its sender
        if let Err(e) = self.monitor_handle.await {
            tracing::warn!(error = %e, "task monitor did not stop cleanly");
        }
        if let Err(e) = self.consumer_handle.await {
            tracing::warn!(error = %e, "task consumer did not stop cleanly");
        }

        self.manager.shutdown(drain).await;
        for handle in self.background {
            let _ = handle.await;
        }
        self.cache.stop_cleanup_task();
        tracing::info!("bridge stopped");
    }

    /// Serve until Ctrl-C, then drain
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::execution("bridge", format!("cannot listen for Ctrl-C: {e}")))?;
        self.shutdown(true).await;
        Ok(())
    }
}
