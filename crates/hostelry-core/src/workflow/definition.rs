//! Workflow definitions: the registered template for a class of process.
//!
//! A definition is an ordered list of [`Step`]s plus pre-execution
//! validators and lifecycle hooks. It is built once at startup, validated
//! by the engine at registration, and then shared read-only by every
//! execution of its `workflow_type`.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use hostelry_types::workflow::WorkflowPriority;
use serde_json::Value;
use thiserror::Error;

use super::context::WorkflowContext;
use super::execution::WorkflowExecution;
use super::step::Step;

/// Budget for a whole run when the definition does not set one.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or validating a definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two steps share a name.
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),
}

// ---------------------------------------------------------------------------
// Validators and hooks
// ---------------------------------------------------------------------------

/// Pre-execution check over the input context. `Ok(false)` or `Err` rejects.
pub type Validator = Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Called with a copy of the execution after completion or failure.
pub type ExecutionHook =
    Arc<dyn Fn(WorkflowExecution) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Called after each successfully executed step.
pub type StepHook = Arc<dyn Fn(StepCompletion) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Payload handed to `on_step_complete` hooks.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub execution: WorkflowExecution,
    pub step: String,
    pub result: Value,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

pub struct WorkflowDefinition {
    workflow_type: String,
    name: String,
    description: Option<String>,
    priority: WorkflowPriority,
    max_execution_time: Duration,
    max_concurrent_executions: Option<u32>,
    tags: BTreeSet<String>,
    steps: Vec<Step>,
    validators: Vec<Validator>,
    on_complete: Vec<ExecutionHook>,
    on_error: Vec<ExecutionHook>,
    on_step_complete: Vec<StepHook>,
    /// Step name -> position. Built on first lookup, reset by `add_step`.
    step_index: OnceLock<HashMap<String, usize>>,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            name: name.into(),
            description: None,
            priority: WorkflowPriority::default(),
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            max_concurrent_executions: None,
            tags: BTreeSet::new(),
            steps: Vec::new(),
            validators: Vec::new(),
            on_complete: Vec::new(),
            on_error: Vec::new(),
            on_step_complete: Vec::new(),
            step_index: OnceLock::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: WorkflowPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Wall-clock budget for the whole step loop.
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    /// Cap on simultaneously running executions of this type.
    pub fn with_max_concurrent_executions(mut self, limit: u32) -> Self {
        self.max_concurrent_executions = Some(limit);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Append a step. Fails if a step with the same name already exists.
    pub fn add_step(mut self, step: Step) -> Result<Self, WorkflowError> {
        if self.steps.iter().any(|s| s.name() == step.name()) {
            return Err(WorkflowError::DuplicateStep(step.name().to_string()));
        }
        self.steps.push(step);
        self.step_index = OnceLock::new();
        Ok(self)
    }

    pub fn add_validator<F, Fut>(mut self, validator: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.validators.push(Arc::new(move |ctx| validator(ctx).boxed()));
        self
    }

    pub fn on_complete<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WorkflowExecution) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_complete.push(Arc::new(move |exec| hook(exec).boxed()));
        self
    }

    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(WorkflowExecution) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_error.push(Arc::new(move |exec| hook(exec).boxed()));
        self
    }

    pub fn on_step_complete<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(StepCompletion) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_step_complete.push(Arc::new(move |done| hook(done).boxed()));
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn priority(&self) -> WorkflowPriority {
        self.priority
    }

    pub fn max_execution_time(&self) -> Duration {
        self.max_execution_time
    }

    pub fn max_concurrent_executions(&self) -> Option<u32> {
        self.max_concurrent_executions
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn on_complete_hooks(&self) -> &[ExecutionHook] {
        &self.on_complete
    }

    pub fn on_error_hooks(&self) -> &[ExecutionHook] {
        &self.on_error
    }

    pub fn on_step_complete_hooks(&self) -> &[StepHook] {
        &self.on_step_complete
    }

    // -- derived views ------------------------------------------------------

    fn index(&self) -> &HashMap<String, usize> {
        self.step_index.get_or_init(|| {
            self.steps
                .iter()
                .enumerate()
                .map(|(i, s)| (s.name().to_string(), i))
                .collect()
        })
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.index().get(name).map(|&i| &self.steps[i])
    }

    pub fn required_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.is_required()).collect()
    }

    pub fn optional_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| !s.is_required()).collect()
    }

    /// Registration-time structural checks.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.workflow_type.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "workflow_type must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "workflow '{}' must have at least one step",
                self.workflow_type
            )));
        }
        if self.index().len() != self.steps.len() {
            let mut seen = BTreeSet::new();
            for step in &self.steps {
                if !seen.insert(step.name()) {
                    return Err(WorkflowError::DuplicateStep(step.name().to_string()));
                }
            }
        }
        if self.steps.iter().any(|s| s.name().trim().is_empty()) {
            return Err(WorkflowError::ValidationError(
                "step names must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_executions == Some(0) {
            return Err(WorkflowError::ValidationError(
                "max_concurrent_executions must be at least 1".to_string(),
            ));
        }
        if self.max_execution_time.is_zero() {
            return Err(WorkflowError::ValidationError(
                "max_execution_time must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("workflow_type", &self.workflow_type)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("max_execution_time", &self.max_execution_time)
            .field("max_concurrent_executions", &self.max_concurrent_executions)
            .field("steps", &self.steps)
            .field("validators", &self.validators.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
