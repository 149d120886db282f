//! Workflow execution types for Hostelry.
//!
//! These are the serializable pieces of the workflow engine: the execution
//! state machine, priorities, diagnostics records, per-step and aggregate
//! metrics, retry policy, and the `ExecutionSnapshot` that is persisted for
//! recovery/audit and returned to callers polling status.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow execution.
///
/// Normal path: `Pending -> Running -> Completed`. Failures go
/// `Running -> Failed -> RolledBack` once compensation has run. Executions
/// rejected by admission control stay `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Suspended,
    Retrying,
    RolledBack,
}

impl ExecutionState {
    /// Whether the execution can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Cancelled
                | ExecutionState::RolledBack
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
            ExecutionState::Suspended => "suspended",
            ExecutionState::Retrying => "retrying",
            ExecutionState::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecutionState::Pending),
            "queued" => Ok(ExecutionState::Queued),
            "running" => Ok(ExecutionState::Running),
            "completed" => Ok(ExecutionState::Completed),
            "failed" => Ok(ExecutionState::Failed),
            "cancelled" => Ok(ExecutionState::Cancelled),
            "suspended" => Ok(ExecutionState::Suspended),
            "retrying" => Ok(ExecutionState::Retrying),
            "rolled_back" => Ok(ExecutionState::RolledBack),
            other => Err(format!("invalid execution state: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority attached to a definition or a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for WorkflowPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowPriority::Critical => write!(f, "critical"),
            WorkflowPriority::High => write!(f, "high"),
            WorkflowPriority::Normal => write!(f, "normal"),
            WorkflowPriority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for WorkflowPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(WorkflowPriority::Critical),
            "high" => Ok(WorkflowPriority::High),
            "normal" => Ok(WorkflowPriority::Normal),
            "low" => Ok(WorkflowPriority::Low),
            other => Err(format!("invalid workflow priority: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Severity of a diagnostics entry. Warnings never change the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Error,
}

/// A single error or warning recorded against an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Step the entry relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Timing and retry metrics for one step within one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Handler invocations made (first attempt included).
    pub attempts: u32,
    /// Retries performed (`attempts - 1`, or 0 when skipped).
    pub retry_count: u32,
    /// Wall-clock time spent in the step, backoff sleeps included.
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate metrics for an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_execution_time_ms: u64,
    #[serde(default)]
    pub step_metrics: HashMap<String, StepMetrics>,
    /// Serialized size of the context in bytes, sampled after each step.
    pub context_size: usize,
    pub error_count: u32,
    /// Sum of retries across all steps.
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry/backoff policy for a step.
///
/// A step gets `retry_count + 1` attempts. The sleep before retry `n`
/// (1-based) is `retry_delay_ms * backoff_multiplier^(n-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retry_count: 0,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution snapshot (persisted / polled shape)
// ---------------------------------------------------------------------------

/// Complete serializable view of an execution.
///
/// Written to the persistence sink under `workflow_execution:{execution_id}`
/// on every terminal transition and returned to status pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub workflow_type: String,
    pub workflow_name: String,
    pub state: ExecutionState,
    pub priority: WorkflowPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    pub context: serde_json::Map<String, serde_json::Value>,

    pub current_step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub total_steps: usize,
    pub progress_percentage: f64,
    pub executed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,

    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub metrics: ExecutionMetrics,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    #[serde(default)]
    pub child_execution_ids: Vec<Uuid>,
    #[serde(default)]
    pub tags: BTreeSet<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between start and completion (or now, if still running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// Key under which a snapshot is persisted.
pub fn snapshot_key(execution_id: &Uuid) -> String {
    format!("workflow_execution:{execution_id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
