//! Dependency bookkeeping between queued tasks
//!
//! [`DependencyGraph`] rejects cycles among the tasks the manager knows
//! about. [`DependencyTracker`] answers "are my dependencies done yet" from
//! in-process completions first and the bridge directory second, so a task
//! may depend on work finished by an earlier run.

use crate::filesystem::BridgeFileSystem;
use dashmap::DashMap;
use filebridge_core::{Error, Result, Task, TaskId, TaskStatus};
use parking_lot::Mutex;
use petgraph::algo;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
struct GraphState {
    /// Edges point from a task to the tasks it depends on
    graph: StableDiGraph<TaskId, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
    /// Tasks submitted and not yet finished
    active: HashSet<TaskId>,
}

impl GraphState {
    fn node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(idx) = self.nodes.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.nodes.insert(id.clone(), idx);
        idx
    }

    fn add(&mut self, task: &Task) {
        let from = self.node(&task.id);
        for dep in &task.dependencies {
            let to = self.node(dep);
            if self.graph.find_edge(from, to).is_none() {
                self.graph.add_edge(from, to, ());
            }
        }
        self.active.insert(task.id.clone());
    }

    /// Ids of every task sitting on a cycle
    fn cycle_members(&self) -> Vec<TaskId> {
        let mut members: Vec<TaskId> = algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .flatten()
            .map(|idx| self.graph[idx].clone())
            .collect();
        members.sort();
        members
    }

    fn prune(&mut self, id: &TaskId) {
        let Some(&idx) = self.nodes.get(id) else {
            return;
        };
        if self.active.contains(id) {
            return;
        }
        let connected = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .next()
            .is_some()
            || self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .next()
                .is_some();
        if !connected {
            self.graph.remove_node(idx);
            self.nodes.remove(id);
        }
    }
}

/// Cycle detection over the set of submitted, unfinished tasks
#[derive(Debug, Default)]
pub struct DependencyGraph {
    state: Mutex<GraphState>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of tasks. Either every task is added or, when the batch
    /// would close a cycle, none is and an invalid-task error names the
    /// tasks on the cycle.
    pub fn register_batch(&self, tasks: &[Task]) -> Result<()> {
        let mut state = self.state.lock();
        let mut candidate = state.clone();
        for task in tasks {
            candidate.add(task);
        }

        if algo::is_cyclic_directed(&candidate.graph) {
            let members = candidate.cycle_members();
            let first = tasks
                .first()
                .map(|t| t.id.to_string())
                .unwrap_or_default();
            let names: Vec<&str> = members.iter().map(TaskId::as_str).collect();
            return Err(Error::invalid_task(
                first,
                format!("dependency cycle between {}", names.join(", ")),
            ));
        }

        *state = candidate;
        Ok(())
    }

    pub fn register(&self, task: &Task) -> Result<()> {
        self.register_batch(std::slice::from_ref(task))
    }

    /// Forget a finished task. Its node stays while unfinished tasks still
    /// depend on it.
    pub fn complete(&self, id: &TaskId) {
        let mut state = self.state.lock();
        state.active.remove(id);
        let Some(&idx) = state.nodes.get(id) else {
            return;
        };

        let edges: Vec<_> = state
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        let mut touched = vec![id.clone()];
        for (edge, target) in edges {
            state.graph.remove_edge(edge);
            touched.push(state.graph[target].clone());
        }
        for id in touched {
            state.prune(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of waiting on a task's dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyOutcome {
    Ready,
    /// These dependencies finished in error
    Failed(Vec<TaskId>),
    /// These were still unresolved at the deadline
    TimedOut(Vec<TaskId>),
    /// Shutdown began while waiting
    Cancelled,
}

/// Finished tasks whose status is kept in memory before the oldest are
/// dropped again
pub const DEFAULT_RETAINED_FINISHED: usize = 10_000;

/// Terminal-state lookup for dependencies.
///
/// Only the most recent finished tasks are remembered in memory; older ones
/// are answered from the bridge directory when a file system is attached.
pub struct DependencyTracker {
    fs: Option<BridgeFileSystem>,
    states: DashMap<TaskId, TaskStatus>,
    /// Finished ids, oldest first
    finished: Mutex<VecDeque<TaskId>>,
    retain_finished: usize,
    notify: Notify,
    poll_interval: Duration,
}

impl std::fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyTracker")
            .field("known", &self.states.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl DependencyTracker {
    /// With a file system, tasks not seen in this process are looked up in
    /// the bridge directories
    pub fn new(fs: Option<BridgeFileSystem>) -> Self {
        Self {
            fs,
            states: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retain_finished: DEFAULT_RETAINED_FINISHED,
            notify: Notify::new(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retention(mut self, retain_finished: usize) -> Self {
        self.retain_finished = retain_finished;
        self
    }

    /// Record a status change and wake every waiter
    pub fn record(&self, id: &TaskId, status: TaskStatus) {
        let previous = self.states.insert(id.clone(), status);
        if !status.is_terminal() {
            return;
        }
        if !previous.is_some_and(|s| s.is_terminal()) {
            let mut finished = self.finished.lock();
            finished.push_back(id.clone());
            while finished.len() > self.retain_finished {
                let Some(oldest) = finished.pop_front() else {
                    break;
                };
                self.states.remove_if(&oldest, |_, s| s.is_terminal());
            }
        }
        self.notify.notify_waiters();
    }

    /// Number of tasks whose status is held in memory
    pub fn known(&self) -> usize {
        self.states.len()
    }

    pub async fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        let known = self.states.get(id).map(|s| *s);
        if let Some(status) = known.filter(TaskStatus::is_terminal) {
            return Some(status);
        }
        let Some(fs) = &self.fs else {
            return known;
        };
        match fs.locate(id).await {
            // A quarantined file never runs, so it counts as failed
            Ok(Some((state, _))) => state.status().or(Some(TaskStatus::Error)),
            Ok(None) => known,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "dependency lookup failed");
                known
            }
        }
    }

    /// Wait until every dependency is terminal, one fails, the timeout
    /// passes or shutdown is signalled
    pub async fn wait_for(
        &self,
        deps: &[TaskId],
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DependencyOutcome {
        if deps.is_empty() {
            return DependencyOutcome::Ready;
        }
        let deadline = Instant::now() + timeout;

        loop {
            if *shutdown.borrow() {
                return DependencyOutcome::Cancelled;
            }

            // Register interest before checking so a completion between the
            // check and the wait is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut failed = Vec::new();
            let mut unresolved = Vec::new();
            for dep in deps {
                match self.status_of(dep).await {
                    Some(TaskStatus::Completed) => {}
                    Some(TaskStatus::Error) => failed.push(dep.clone()),
                    _ => unresolved.push(dep.clone()),
                }
            }
            if !failed.is_empty() {
                return DependencyOutcome::Failed(failed);
            }
            if unresolved.is_empty() {
                return DependencyOutcome::Ready;
            }
            if Instant::now() >= deadline {
                return DependencyOutcome::TimedOut(unresolved);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return DependencyOutcome::Cancelled;
                    }
                }
            }
        }
    }
}
