//! Running aggregate of engine outcomes.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::Mutex;

/// Per-workflow-type outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

/// Point-in-time copy of the engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatistics {
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub validation_failures: u64,
    pub by_workflow_type: BTreeMap<String, TypeCounts>,
    /// Sum over successful runs.
    pub total_execution_time_ms: u64,
    pub average_execution_time_ms: f64,
    /// Failure count keyed by error kind.
    pub error_types: BTreeMap<String, u64>,
    pub registered_workflows: usize,
    pub running_executions: usize,
    pub stored_executions: usize,
}

/// Mutex-guarded accumulator owned by the engine.
#[derive(Debug, Default)]
pub struct StatisticsRecorder {
    inner: Mutex<EngineStatistics>,
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_started(&self, workflow_type: &str) {
        let mut stats = self.inner.lock().await;
        stats.total_executions += 1;
        entry(&mut stats, workflow_type).started += 1;
    }

    pub async fn record_completed(&self, workflow_type: &str, duration_ms: u64) {
        let mut stats = self.inner.lock().await;
        stats.completed += 1;
        stats.total_execution_time_ms += duration_ms;
        stats.average_execution_time_ms =
            stats.total_execution_time_ms as f64 / stats.completed as f64;
        entry(&mut stats, workflow_type).completed += 1;
    }

    pub async fn record_failed(&self, workflow_type: &str, error_kind: &str) {
        let mut stats = self.inner.lock().await;
        stats.failed += 1;
        *stats.error_types.entry(error_kind.to_string()).or_default() += 1;
        entry(&mut stats, workflow_type).failed += 1;
    }

    pub async fn record_validation_failure(&self, workflow_type: &str) {
        let mut stats = self.inner.lock().await;
        stats.validation_failures += 1;
        *stats.error_types.entry("validation_failed".to_string()).or_default() += 1;
        entry(&mut stats, workflow_type).failed += 1;
    }

    pub async fn record_cancelled(&self, workflow_type: &str) {
        let mut stats = self.inner.lock().await;
        stats.cancelled += 1;
        entry(&mut stats, workflow_type).cancelled += 1;
    }

    pub async fn record_rejected(&self, workflow_type: &str) {
        let mut stats = self.inner.lock().await;
        stats.rejected += 1;
        entry(&mut stats, workflow_type).rejected += 1;
    }

    /// Copy of the aggregate. Live counts are left at zero for the caller to fill.
    pub async fn snapshot(&self) -> EngineStatistics {
        self.inner.lock().await.clone()
    }
}

fn entry<'a>(stats: &'a mut EngineStatistics, workflow_type: &str) -> &'a mut TypeCounts {
    stats
        .by_workflow_type
        .entry(workflow_type.to_string())
        .or_default()
}
