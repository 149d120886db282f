//! Event types for the workflow engine event bus.
//!
//! `WorkflowEvent` is broadcast on every execution and step transition.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events emitted by the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution passed validation and started running steps.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_type: String,
        initiated_by: Option<String>,
    },

    /// An execution was rejected by the per-type concurrency limit.
    ExecutionRejected {
        execution_id: Uuid,
        workflow_type: String,
        limit: u32,
    },

    /// A step finished successfully.
    StepCompleted {
        execution_id: Uuid,
        step: String,
        duration_ms: u64,
    },

    /// A step attempt failed and another attempt is scheduled.
    StepRetrying {
        execution_id: Uuid,
        step: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A step exhausted its attempts.
    StepFailed {
        execution_id: Uuid,
        step: String,
        error: String,
        required: bool,
    },

    /// A step's precondition evaluated false.
    StepSkipped { execution_id: Uuid, step: String },

    /// All steps finished.
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_type: String,
        duration_ms: u64,
        steps_executed: u32,
    },

    /// The execution failed; compensation follows.
    ExecutionFailed {
        execution_id: Uuid,
        workflow_type: String,
        error: String,
    },

    /// Compensation finished for a failed execution.
    ExecutionRolledBack {
        execution_id: Uuid,
        steps_rolled_back: u32,
    },

    /// The execution was cancelled by a caller.
    ExecutionCancelled { execution_id: Uuid, reason: String },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::ExecutionRejected { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepRetrying { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::StepSkipped { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionRolledBack { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id, .. } => *execution_id,
        }
    }
}
