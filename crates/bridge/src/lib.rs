//! filebridge: exchange work between two independent tools through a
//! shared directory tree
//!
//! A producer drops task files into `tasks/pending`; the bridge claims them,
//! runs them through a pluggable [`TaskExecutor`] with bounded concurrency,
//! and answers with result files under `results/`. [`BridgeService`] wires
//! the queue, cache, project registry and recovery layer together.

pub mod health;
pub mod service;

pub use health::HealthReport;
pub use service::{BridgeService, BridgeServiceBuilder};

pub use filebridge_core::{Error, ErrorKind, Result, Task, TaskResult};
pub use filebridge_task::{ExecutionContext, TaskExecutor};
