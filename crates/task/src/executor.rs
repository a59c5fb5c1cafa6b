//! Bounded asynchronous execution of claimed tasks
//!
//! [`AsyncTaskManager`] runs at most `worker_count` handlers at a time.
//! Submission never blocks: every task gets a spawned driver that waits for
//! its dependencies, then for a worker slot, then runs the handler under a
//! timeout with panics caught. Each submission resolves its [`TaskHandle`]
//! exactly once.
//!
//! Handler errors and timeouts are retried with exponential backoff when a
//! [`RetryPolicy`] allows it. While a task is in flight the observer is
//! asked to keep its claim alive, and the claim is checked once more right
//! before the handler starts.

use crate::dependency::{DependencyGraph, DependencyOutcome, DependencyTracker};
use async_trait::async_trait;
use chrono::Utc;
use filebridge_config::BridgeSettings;
use filebridge_core::{
    Error, ErrorKind, ExecutionMetrics, Result, Task, TaskId, TaskResult, TaskStatus,
};
use filebridge_utils::tracing as events;
use futures::future::{select_all, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

/// The work behind a task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<TaskResult>;
}

/// Hooks into a task's lifecycle.
///
/// `on_finished` is called once per task with its final outcome, before the
/// handle resolves and before dependents are released. It is skipped when
/// the claim was lost, since the task's files are no longer ours.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_finished(&self, task: &Task, outcome: &TaskOutcome);

    /// A failed attempt will be retried; `attempt` is the number that failed
    async fn on_retry(&self, _task: &Task, _failure: &TaskFailure, _attempt: u32) {}

    /// Called every [`ExecutorConfig::claim_heartbeat`] while the task is in
    /// flight
    async fn keep_alive(&self, _task: &Task) {}

    /// Checked once a worker slot is free, right before the handler starts
    async fn still_claimed(&self, _task: &Task) -> bool {
        true
    }
}

/// Bounded exponential backoff for failed attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first; zero disables retries
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: settings.retry_delay(),
            backoff_multiplier: settings.backoff_multiplier,
            max_delay: settings.max_retry_delay(),
        }
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based):
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Only handler errors and timeouts are retried, and never when the
    /// error says the task itself is refused or misconfigured
    pub fn allows(&self, failure: &TaskFailure, attempt: u32) -> bool {
        let retryable_reason = matches!(
            failure.reason,
            FailureReason::Handler | FailureReason::TimedOut
        );
        let retryable_kind = !matches!(
            failure.kind,
            Some(ErrorKind::Security | ErrorKind::Configuration | ErrorKind::TaskParse)
        );
        attempt <= self.max_retries && retryable_reason && retryable_kind
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    pub execution_timeout: Duration,
    pub dependency_timeout: Duration,
    pub retry: RetryPolicy,
    pub claim_heartbeat: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            execution_timeout: Duration::from_secs(300),
            dependency_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            claim_heartbeat: Duration::from_secs(60),
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            worker_count: settings.worker_count.max(1),
            execution_timeout: settings.execution_timeout(),
            dependency_timeout: settings.dependency_timeout(),
            retry: RetryPolicy::from_settings(settings),
            claim_heartbeat: settings.claim_heartbeat(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The handler returned an error
    Handler,
    Panicked,
    TimedOut,
    DependencyFailed,
    DependencyTimedOut,
    /// The task file left `tasks/processing` before the handler started
    ClaimLost,
    /// The manager stopped before the task could run
    Shutdown,
}

/// Why a task did not produce a result of its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub reason: FailureReason,
    pub kind: Option<ErrorKind>,
    pub message: String,
    /// Dependencies that failed or never resolved
    pub unresolved: Vec<TaskId>,
    pub metrics: ExecutionMetrics,
}

impl TaskFailure {
    pub fn new(task_id: TaskId, reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            task_id,
            reason,
            kind: None,
            message: message.into(),
            unresolved: Vec::new(),
            metrics: ExecutionMetrics::instant(),
        }
    }

    fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn with_unresolved(mut self, unresolved: Vec<TaskId>) -> Self {
        self.unresolved = unresolved;
        self
    }

    fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// The error result written for this failure
    pub fn to_result(&self) -> TaskResult {
        let mut result = TaskResult::error(self.task_id.clone(), &self.message)
            .with_metrics(self.metrics);
        for dep in &self.unresolved {
            result = result.with_next_step(format!("Check dependency {dep}"));
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(TaskResult),
    Failed(TaskFailure),
    Cancelled,
}

impl TaskOutcome {
    /// Terminal queue status this outcome moves the task file to
    pub fn task_status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed(result) if !result.status.is_error() => TaskStatus::Completed,
            _ => TaskStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.task_status() == TaskStatus::Completed
    }
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
/// Cancelled before the handler started
const CANCELLED: u8 = 3;
/// Cancelled while running; the result is withheld from the handle
const DISCARDED: u8 = 4;

#[derive(Debug)]
struct HandleState {
    phase: AtomicU8,
}

impl HandleState {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(QUEUED),
        }
    }

    fn transition(&self, from: u8, to: u8) -> std::result::Result<u8, u8> {
        self.phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The handler will never run
    PreventedExecution,
    /// The handler is running; its result will not reach the handle
    ResultDiscarded,
    AlreadyFinished,
}

/// Resolves to the task's [`TaskOutcome`]
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    state: Arc<HandleState>,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn cancel(&self) -> CancelOutcome {
        if self.state.transition(QUEUED, CANCELLED).is_ok() {
            return CancelOutcome::PreventedExecution;
        }
        match self.state.transition(RUNNING, DISCARDED) {
            Ok(_) => CancelOutcome::ResultDiscarded,
            Err(CANCELLED) => CancelOutcome::PreventedExecution,
            Err(DISCARDED) => CancelOutcome::ResultDiscarded,
            Err(_) => CancelOutcome::AlreadyFinished,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) == FINISHED
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.task_id.clone();
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                TaskOutcome::Failed(TaskFailure::new(
                    task_id,
                    FailureReason::Shutdown,
                    "task driver stopped without an outcome",
                ))
            })
        })
    }
}

/// Counters for the health surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStatistics {
    pub submitted: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

struct ManagerInner {
    handler: Arc<dyn TaskHandler>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    graph: DependencyGraph,
    tracker: Arc<DependencyTracker>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    drivers: Mutex<Vec<(Arc<HandleState>, JoinHandle<()>)>>,
    counters: Counters,
}

#[derive(Clone)]
pub struct AsyncTaskManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for AsyncTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskManager")
            .field("config", &self.inner.config)
            .field("statistics", &self.statistics())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl AsyncTaskManager {
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        config: ExecutorConfig,
        tracker: Arc<DependencyTracker>,
        observer: Option<Arc<dyn ExecutionObserver>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let permits = config.worker_count.max(1);
        Self {
            inner: Arc::new(ManagerInner {
                handler,
                observer,
                semaphore: Arc::new(Semaphore::new(permits)),
                config,
                graph: DependencyGraph::new(),
                tracker,
                accepting: AtomicBool::new(true),
                shutdown_tx,
                drivers: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.inner.tracker
    }

    pub fn statistics(&self) -> ExecutorStatistics {
        let c = &self.inner.counters;
        ExecutorStatistics {
            submitted: c.submitted.load(Ordering::Relaxed),
            running: c.running.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Queue one task. Fails only when the manager is shutting down or the
    /// task is invalid (including a dependency cycle).
    pub fn submit(&self, task: Task) -> Result<TaskHandle> {
        self.submit_batch(vec![task])?
            .pop()
            .ok_or_else(|| Error::configuration("submission produced no handle"))
    }

    /// Queue several tasks that may depend on each other. The whole batch is
    /// rejected if any task is invalid or the batch closes a cycle.
    pub fn submit_batch(&self, tasks: Vec<Task>) -> Result<Vec<TaskHandle>> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            let id = tasks.first().map(|t| t.id.to_string()).unwrap_or_default();
            return Err(Error::execution(id, "task manager is shutting down"));
        }
        for task in &tasks {
            task.validate()?;
        }
        self.inner.graph.register_batch(&tasks)?;

        let mut drivers = self.inner.drivers.lock();
        drivers.retain(|(_, handle)| !handle.is_finished());

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            self.inner.tracker.record(&task.id, TaskStatus::Processing);
            self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

            let state = Arc::new(HandleState::new());
            let (tx, rx) = oneshot::channel();
            let span = events::task_span(task.id.as_str(), &task.project_id);
            let handle = TaskHandle {
                task_id: task.id.clone(),
                state: Arc::clone(&state),
                rx,
            };

            let inner = Arc::clone(&self.inner);
            let driver_state = Arc::clone(&state);
            let join = tokio::spawn(
                async move { drive(inner, task, driver_state, tx).await }.instrument(span),
            );
            drivers.push((state, join));
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Wait for whichever handle resolves first and remove it from `handles`
    pub async fn await_any(
        handles: &mut Vec<TaskHandle>,
        timeout: Duration,
    ) -> Result<(TaskId, TaskOutcome)> {
        if handles.is_empty() {
            return Err(Error::configuration("await_any called without handles"));
        }
        let (outcome, index) =
            match tokio::time::timeout(timeout, select_all(handles.iter_mut())).await {
                Ok((outcome, index, rest)) => {
                    drop(rest);
                    (outcome, index)
                }
                Err(_) => return Err(Error::timeout("await_any", timeout)),
            };
        let handle = handles.remove(index);
        Ok((handle.task_id, outcome))
    }

    /// Stop accepting work and wait for every driver to finish.
    ///
    /// With `drain` queued tasks still run. Without it, tasks that have not
    /// started resolve as cancelled; running handlers are allowed to finish.
    pub async fn shutdown(&self, drain: bool) {
        self.inner.accepting.store(false, Ordering::Release);

        let drivers = std::mem::take(&mut *self.inner.drivers.lock());
        if !drain {
            for (state, _) in &drivers {
                let _ = state.transition(QUEUED, CANCELLED);
            }
            self.inner.semaphore.close();
            let _ = self.inner.shutdown_tx.send(true);
        }

        tracing::info!(drivers = drivers.len(), drain, "task manager shutting down");
        for (_, join) in drivers {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "task driver ended abnormally");
            }
        }
    }
}

/// Full lifecycle of one submitted task
async fn drive(
    inner: Arc<ManagerInner>,
    task: Task,
    state: Arc<HandleState>,
    tx: oneshot::Sender<TaskOutcome>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let heartbeat = inner.observer.as_ref().map(|observer| {
        let observer = Arc::clone(observer);
        let task = task.clone();
        let every = inner.config.claim_heartbeat.max(Duration::from_millis(1));
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    observer.keep_alive(&task).await;
                }
            }
            .in_current_span(),
        )
    });

    let waited = inner
        .tracker
        .wait_for(
            &task.dependencies,
            inner.config.dependency_timeout,
            &mut shutdown,
        )
        .await;

    let (observed, delivered) = match waited {
        DependencyOutcome::Ready => execute(&inner, &task, &state, &mut shutdown).await,
        DependencyOutcome::Cancelled => (TaskOutcome::Cancelled, TaskOutcome::Cancelled),
        DependencyOutcome::Failed(ids) => {
            let names: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
            let failure = TaskFailure::new(
                task.id.clone(),
                FailureReason::DependencyFailed,
                format!("dependency failed: {}", names.join(", ")),
            )
            .with_kind(ErrorKind::Execution)
            .with_unresolved(ids);
            settle_without_running(&state, TaskOutcome::Failed(failure))
        }
        DependencyOutcome::TimedOut(ids) => {
            let names: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
            let failure = TaskFailure::new(
                task.id.clone(),
                FailureReason::DependencyTimedOut,
                format!(
                    "dependencies unresolved after {:?}: {}",
                    inner.config.dependency_timeout,
                    names.join(", ")
                ),
            )
            .with_kind(ErrorKind::Execution)
            .with_unresolved(ids);
            settle_without_running(&state, TaskOutcome::Failed(failure))
        }
    };

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    let claim_lost = matches!(
        &observed,
        TaskOutcome::Failed(failure) if failure.reason == FailureReason::ClaimLost
    );
    if claim_lost {
        tracing::warn!(task_id = %task.id, "task claim lost before execution; not running it");
    } else if let Some(observer) = &inner.observer {
        observer.on_finished(&task, &observed).await;
    }

    let counters = &inner.counters;
    match &observed {
        TaskOutcome::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
        outcome if outcome.is_success() => counters.completed.fetch_add(1, Ordering::Relaxed),
        _ => counters.failed.fetch_add(1, Ordering::Relaxed),
    };

    inner.tracker.record(&task.id, observed.task_status());
    inner.graph.complete(&task.id);

    if tx.send(delivered).is_err() {
        tracing::debug!(task_id = %task.id, "task handle dropped before completion");
    }
}

/// A task that never reached its handler: a cancel that raced in wins
fn settle_without_running(state: &HandleState, outcome: TaskOutcome) -> (TaskOutcome, TaskOutcome) {
    match state.transition(QUEUED, FINISHED) {
        Ok(_) => (outcome.clone(), outcome),
        Err(_) => (TaskOutcome::Cancelled, TaskOutcome::Cancelled),
    }
}

async fn execute(
    inner: &ManagerInner,
    task: &Task,
    state: &HandleState,
    shutdown: &mut watch::Receiver<bool>,
) -> (TaskOutcome, TaskOutcome) {
    let Ok(_permit) = Arc::clone(&inner.semaphore).acquire_owned().await else {
        let _ = state.transition(QUEUED, CANCELLED);
        return (TaskOutcome::Cancelled, TaskOutcome::Cancelled);
    };
    if let Some(observer) = &inner.observer {
        if !observer.still_claimed(task).await {
            let failure = TaskFailure::new(
                task.id.clone(),
                FailureReason::ClaimLost,
                "task file left processing before execution started",
            )
            .with_kind(ErrorKind::Execution);
            return settle_without_running(state, TaskOutcome::Failed(failure));
        }
    }
    if state.transition(QUEUED, RUNNING).is_err() {
        return (TaskOutcome::Cancelled, TaskOutcome::Cancelled);
    }

    inner.counters.running.fetch_add(1, Ordering::Relaxed);
    events::task_started(task.id.as_str(), &task.project_id);
    let started = Utc::now();

    let retry = &inner.config.retry;
    let mut attempt = 1;
    let outcome = loop {
        let outcome = attempt_once(inner, task, started).await;
        let TaskOutcome::Failed(failure) = &outcome else {
            break outcome;
        };
        if !retry.allows(failure, attempt) || *shutdown.borrow() {
            break outcome;
        }
        // Discarded tasks are not retried
        if state.phase.load(Ordering::Acquire) != RUNNING {
            break outcome;
        }

        let delay = retry.delay_for(attempt);
        tracing::warn!(
            task_id = %task.id,
            attempt,
            max_retries = retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %failure.message,
            "task attempt failed; retrying"
        );
        inner.counters.retried.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &inner.observer {
            observer.on_retry(task, failure, attempt).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break outcome,
        }
        attempt += 1;
    };
    inner.counters.running.fetch_sub(1, Ordering::Relaxed);

    let metrics = match &outcome {
        TaskOutcome::Completed(result) => result.metrics,
        TaskOutcome::Failed(failure) => failure.metrics,
        TaskOutcome::Cancelled => ExecutionMetrics::between(started, Utc::now()),
    };
    events::task_completed(task.id.as_str(), metrics.duration_ms, outcome.is_success());

    match state.transition(RUNNING, FINISHED) {
        Ok(_) => (outcome.clone(), outcome),
        Err(_) => (outcome, TaskOutcome::Cancelled),
    }
}

/// One handler run under the timeout with panics caught. Metrics span every
/// attempt since `started`.
async fn attempt_once(
    inner: &ManagerInner,
    task: &Task,
    started: chrono::DateTime<Utc>,
) -> TaskOutcome {
    let run = AssertUnwindSafe(inner.handler.handle(task)).catch_unwind();
    let result = tokio::time::timeout(inner.config.execution_timeout, run).await;
    let metrics = ExecutionMetrics::between(started, Utc::now());

    match result {
        Ok(Ok(Ok(mut produced))) => {
            produced.task_id = task.id.clone();
            produced.metrics = metrics;
            TaskOutcome::Completed(produced)
        }
        Ok(Ok(Err(e))) => TaskOutcome::Failed(
            TaskFailure::new(task.id.clone(), FailureReason::Handler, e.to_string())
                .with_kind(e.kind())
                .with_metrics(metrics),
        ),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task_id = %task.id, panic = %message, "task handler panicked");
            TaskOutcome::Failed(
                TaskFailure::new(
                    task.id.clone(),
                    FailureReason::Panicked,
                    format!("handler panicked: {message}"),
                )
                .with_kind(ErrorKind::Execution)
                .with_metrics(metrics),
            )
        }
        Err(_) => TaskOutcome::Failed(
            TaskFailure::new(
                task.id.clone(),
                FailureReason::TimedOut,
                format!(
                    "execution exceeded timeout of {:?}",
                    inner.config.execution_timeout
                ),
            )
            .with_kind(ErrorKind::Execution)
            .with_metrics(metrics),
        ),
    }
}
