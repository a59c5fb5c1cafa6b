//! Combined health surface of a running bridge

use chrono::{DateTime, Utc};
use filebridge_cache::CacheStatistics;
use filebridge_recovery::{DiagnosticReport, RecoveryStatistics};
use filebridge_task::{ExecutorStatistics, QueueStats};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub diagnostic: DiagnosticReport,
    pub cache: CacheStatistics,
    pub queue: QueueStats,
    pub executor: ExecutorStatistics,
    pub recovery: RecoveryStatistics,
}

impl HealthReport {
    /// Healthy tree and nothing quarantined or failed by the executor
    pub fn is_healthy(&self) -> bool {
        self.diagnostic.healthy && self.queue.quarantine == 0 && self.executor.failed == 0
    }
}
