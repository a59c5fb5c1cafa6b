//! Text forms of tasks and results exchanged through the bridge directories
//!
//! Both are small Markdown records: a `## MARKER: value` header, `### Name`
//! sections and a closing `---`. File names encode the project, creation
//! time and task id so a directory listing alone is enough to order work.

pub mod naming;
pub mod result_file;
pub mod sections;
pub mod task_file;

pub use naming::{
    is_task_file_name, result_file_name, result_sidecar_name, superseded_names,
    task_sidecar_name, TaskFileName,
};
pub use result_file::{parse_result, render_result};
pub use task_file::{parse_task, render_task};
