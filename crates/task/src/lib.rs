//! Task queue and execution for filebridge
//!
//! This crate owns the text protocol for task and result files, the
//! directory-backed queue, discovery of new work, dependency tracking and
//! the bounded executor that runs claimed tasks.

pub mod context;
pub mod dependency;
pub mod executor;
pub mod filesystem;
pub mod monitor;
pub mod protocol;
pub mod worker;

pub use context::{ProjectContext, ProjectContextLoader};
pub use dependency::{DependencyGraph, DependencyOutcome, DependencyTracker};
pub use executor::{
    AsyncTaskManager, CancelOutcome, ExecutionObserver, ExecutorConfig, ExecutorStatistics,
    FailureReason, RetryPolicy, TaskFailure, TaskHandle, TaskHandler, TaskOutcome,
};
pub use filesystem::{BridgeFileSystem, ClaimOutcome, FinishOutcome, QueueState, QueueStats};
pub use monitor::{FileDisposition, TaskMonitor};
pub use protocol::{parse_result, parse_task, render_result, render_task, TaskFileName};
pub use worker::{ExecutionContext, QueueObserver, QueueWorker, TaskExecutor};
