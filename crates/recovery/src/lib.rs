//! Self-diagnosis and repair of a filebridge directory tree
//!
//! [`RecoveryManager`] checks the required directories, both configuration
//! files, directory permissions and tasks stranded in `tasks/processing`,
//! then repairs what it safely can. Every repair attempt lands in
//! `logs/recovery.log` as one JSON line.

pub mod findings;
pub mod log;
pub mod manager;

pub use findings::{ConfigFile, DiagnosticReport, Finding, FindingKind, FindingSeverity};
pub use log::{RecoveryLog, RecoveryRecord};
pub use manager::{RecoveryManager, RecoveryReport, RecoveryStatistics};
