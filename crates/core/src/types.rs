//! Domain records exchanged through the bridge directory

pub mod project;
pub mod result;
pub mod task;

pub use project::{validate_project_id, ProjectRecord};
pub use result::{
    ChangeKind, ExecutionMetrics, FileChange, Issue, ResultStatus, Severity, TaskResult,
};
pub use task::{CodeFragment, Priority, Task, TaskId, TaskKind, TaskStatus};
