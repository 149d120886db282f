//! Live record of one run of a workflow definition.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hostelry_types::workflow::{
    ErrorRecord, ErrorSeverity, ExecutionMetrics, ExecutionSnapshot, ExecutionState,
    WorkflowPriority,
};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::context::WorkflowContext;
use super::definition::WorkflowDefinition;
use super::step::StepRuntime;

/// Mutable state of a single execution. Owned by the engine's registry;
/// callers receive clones.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_type: String,
    pub workflow_name: String,
    pub total_steps: usize,
    pub context: WorkflowContext,
    pub state: ExecutionState,
    pub current_step_index: usize,
    pub current_step_name: Option<String>,
    pub executed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub step_runtime: HashMap<String, StepRuntime>,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
    pub metrics: ExecutionMetrics,
    pub result: Option<Value>,
    pub parent_execution_id: Option<Uuid>,
    pub child_execution_ids: Vec<Uuid>,
    pub tags: BTreeSet<String>,
    pub priority: WorkflowPriority,
    pub initiated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// New `Pending` execution of `definition` over a private copy of `input`.
    pub fn new(
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        input: &Map<String, Value>,
        initiated_by: Option<String>,
    ) -> Self {
        Self {
            execution_id,
            workflow_type: definition.workflow_type().to_string(),
            workflow_name: definition.name().to_string(),
            total_steps: definition.steps().len(),
            context: WorkflowContext::from_map(input),
            state: ExecutionState::Pending,
            current_step_index: 0,
            current_step_name: None,
            executed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            step_runtime: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metrics: ExecutionMetrics::default(),
            result: None,
            parent_execution_id: None,
            child_execution_ids: Vec::new(),
            tags: definition.tags().clone(),
            priority: definition.priority(),
            initiated_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall time since start, up to completion or now. `None` before start.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().ok()
    }

    /// Share of steps reached, in percent. Zero for a definition with no steps.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.current_step_index as f64 / self.total_steps as f64 * 100.0
    }

    /// Record a diagnostic. Errors bump `metrics.error_count`; warnings do not.
    pub fn add_error(
        &mut self,
        message: impl Into<String>,
        step: Option<&str>,
        severity: ErrorSeverity,
    ) {
        let record = ErrorRecord {
            message: message.into(),
            step: step.map(str::to_string),
            severity,
            timestamp: Utc::now(),
        };
        match severity {
            ErrorSeverity::Error => {
                self.errors.push(record);
                self.metrics.error_count += 1;
            }
            ErrorSeverity::Warning => self.warnings.push(record),
        }
    }

    pub fn add_warning(&mut self, message: impl Into<String>, step: Option<&str>) {
        self.add_error(message, step, ErrorSeverity::Warning);
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_child(&mut self, child: Uuid) {
        if !self.child_execution_ids.contains(&child) {
            self.child_execution_ids.push(child);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Serializable view of the execution, context copied at this instant.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let mut metrics = self.metrics.clone();
        metrics.context_size = self.context.size_bytes();

        ExecutionSnapshot {
            execution_id: self.execution_id,
            workflow_type: self.workflow_type.clone(),
            workflow_name: self.workflow_name.clone(),
            state: self.state,
            priority: self.priority,
            initiated_by: self.initiated_by.clone(),
            context: self.context.to_map(),
            current_step_index: self.current_step_index,
            current_step_name: self.current_step_name.clone(),
            total_steps: self.total_steps,
            progress_percentage: self.progress_percentage(),
            executed_steps: self.executed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            skipped_steps: self.skipped_steps.clone(),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            result: self.result.clone(),
            metrics,
            parent_execution_id: self.parent_execution_id,
            child_execution_ids: self.child_execution_ids.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_secs: self.duration().map(|d| d.as_secs_f64()),
        }
    }
}
