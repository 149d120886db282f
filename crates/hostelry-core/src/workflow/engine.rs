//! The workflow engine: registry, admission control, step loop and rollback.
//!
//! `execute_workflow` drives one execution end to end:
//!
//! 1. Resolve the definition and create a `Pending` execution over a private
//!    copy of the caller's input.
//! 2. Admission control: a per-type semaphore, acquired with
//!    `try_acquire_owned`. A rejected execution is left `Queued`.
//! 3. Run validators (each under the validator timeout).
//! 4. Run the steps in definition order under the definition's
//!    `max_execution_time`.
//! 5. On success: `Completed`, then `on_complete` hooks. On failure: `Failed`,
//!    `on_error` hooks, reverse rollback of executed steps, `RolledBack`, and
//!    the root-cause error is returned.
//! 6. Always: leave the running set and persist a snapshot (best effort).
//!
//! Cancellation is cooperative. `cancel_execution` marks the execution and
//! trips its token; the step loop checks the token between steps and never
//! interrupts a handler already in flight.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hostelry_types::config::EngineConfig;
use hostelry_types::event::WorkflowEvent;
use hostelry_types::workflow::{ErrorSeverity, ExecutionState, WorkflowPriority, snapshot_key};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::storage::kv_store::KvStore;
use crate::storage::memory::MemoryKvStore;

use super::blocking::{BlockingError, BlockingPool};
use super::context::WorkflowContext;
use super::definition::{ExecutionHook, StepCompletion, WorkflowDefinition, WorkflowError};
use super::execution::WorkflowExecution;
use super::statistics::{EngineStatistics, StatisticsRecorder};
use super::step::{StepError, StepOutcome, StepRuntime};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),

    #[error("workflow type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] WorkflowError),

    /// A pre-execution validator rejected the input. No step ran.
    #[error("validation failed for workflow '{workflow_type}': {reason}")]
    ValidationFailed { workflow_type: String, reason: String },

    /// Admission control rejected the execution; it is left `Queued`.
    #[error("concurrency limit of {limit} reached for workflow '{workflow_type}'")]
    ConcurrencyLimitReached { workflow_type: String, limit: u32 },

    #[error("execution id already in use: {0}")]
    DuplicateExecution(Uuid),

    /// A required step exhausted its attempts. Rollback has already run.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    /// The run exceeded the definition's `max_execution_time`.
    #[error("workflow '{workflow_type}' exceeded its time budget of {limit:?}")]
    WorkflowTimeout { workflow_type: String, limit: Duration },

    #[error("execution {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Blocking(#[from] BlockingError),
}

impl EngineError {
    /// Stable label used for the statistics error histogram.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownWorkflow(_) => "unknown_workflow",
            EngineError::AlreadyRegistered(_) => "already_registered",
            EngineError::InvalidDefinition(_) => "invalid_definition",
            EngineError::ValidationFailed { .. } => "validation_failed",
            EngineError::ConcurrencyLimitReached { .. } => "concurrency_limit",
            EngineError::DuplicateExecution(_) => "duplicate_execution",
            EngineError::StepFailed { source, .. } => match source {
                StepError::Handler(_) => "step_failed",
                StepError::Timeout { .. } => "step_timeout",
                StepError::ResultRejected { .. } => "step_result_rejected",
                StepError::Condition { .. } => "step_condition",
            },
            EngineError::WorkflowTimeout { .. } => "workflow_timeout",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Blocking(_) => "blocking",
        }
    }

    /// The failing handler's own error, for downcasting by callers.
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            EngineError::StepFailed { source, .. } => source.handler_error(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionOptions
// ---------------------------------------------------------------------------

/// Optional parameters of `execute_workflow`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub initiated_by: Option<String>,
    pub execution_id: Option<Uuid>,
    pub parent_execution_id: Option<Uuid>,
    pub priority: Option<WorkflowPriority>,
    pub tags: BTreeSet<String>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiated_by(mut self, who: impl Into<String>) -> Self {
        self.initiated_by = Some(who.into());
        self
    }

    pub fn execution_id(mut self, id: Uuid) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn parent(mut self, parent_execution_id: Uuid) -> Self {
        self.parent_execution_id = Some(parent_execution_id);
        self
    }

    pub fn priority(mut self, priority: WorkflowPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Stored execution: the record behind its own lock, plus its cancel token.
#[derive(Clone)]
struct ExecutionSlot {
    record: Arc<RwLock<WorkflowExecution>>,
    cancel: CancellationToken,
}

type Housekeeping = Option<(CancellationToken, JoinHandle<()>)>;

struct EngineInner<K> {
    config: EngineConfig,
    registry: DashMap<String, Arc<WorkflowDefinition>>,
    /// Per-workflow-type admission semaphores.
    semaphores: DashMap<String, Arc<Semaphore>>,
    executions: DashMap<Uuid, ExecutionSlot>,
    /// Execution id -> workflow type, for runs currently in the step loop.
    running: DashMap<Uuid, String>,
    stats: StatisticsRecorder,
    events: EventBus,
    blocking: BlockingPool,
    store: Option<Arc<K>>,
    housekeeping: Mutex<Housekeeping>,
}

/// Orchestrates registered workflow definitions.
///
/// Cloning is cheap; all clones share the same registry and execution store.
pub struct WorkflowEngine<K: KvStore = MemoryKvStore> {
    inner: Arc<EngineInner<K>>,
}

impl<K: KvStore> Clone for WorkflowEngine<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WorkflowEngine<MemoryKvStore> {
    /// Engine without a persistence sink.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }
}

impl<K: KvStore + 'static> WorkflowEngine<K> {
    /// Engine that writes terminal snapshots to `store`.
    pub fn with_persistence(config: EngineConfig, store: K) -> Self {
        Self::build(config, Some(Arc::new(store)))
    }

    fn build(config: EngineConfig, store: Option<Arc<K>>) -> Self {
        let events = EventBus::new(config.event_bus_capacity);
        let blocking = BlockingPool::new(config.max_blocking_workers);
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: DashMap::new(),
                semaphores: DashMap::new(),
                executions: DashMap::new(),
                running: DashMap::new(),
                stats: StatisticsRecorder::new(),
                events,
                blocking,
                store,
                housekeeping: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Option<&K> {
        self.inner.store.as_deref()
    }

    /// Receive every lifecycle event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Spawn the housekeeping loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut guard = self.inner.housekeeping.lock().await;
        if guard.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let stop = token.clone();
        let engine = self.clone();
        let period = self.inner.config.cleanup_interval().max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => engine.housekeep().await,
                }
            }
            tracing::debug!("housekeeping loop stopped");
        });

        tracing::info!(interval_secs = period.as_secs(), "workflow engine started");
        *guard = Some((token, handle));
    }

    /// Stop the housekeeping loop and wait for it to exit.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.inner.housekeeping.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "housekeeping task ended abnormally");
        }
        tracing::info!("workflow engine stopped");
    }

    async fn housekeep(&self) {
        self.evict_history().await;
        if let Some(store) = &self.inner.store {
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "purged expired snapshots"),
                Err(e) => tracing::warn!(error = %e, "failed to purge expired snapshots"),
            }
        }
    }

    // -- registry -----------------------------------------------------------

    /// Register a definition. Each workflow type can be registered once.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        definition.validate()?;

        match self.inner.registry.entry(definition.workflow_type().to_string()) {
            Entry::Occupied(entry) => Err(EngineError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::info!(
                    workflow_type = definition.workflow_type(),
                    steps = definition.steps().len(),
                    "registered workflow"
                );
                entry.insert(Arc::new(definition));
                Ok(())
            }
        }
    }

    pub fn get_definition(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner
            .registry
            .get(workflow_type)
            .map(|d| Arc::clone(d.value()))
    }

    /// Registered workflow types, sorted.
    pub fn registered_workflows(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.registry.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    // -- execution ----------------------------------------------------------

    /// Run a registered workflow to completion against a copy of `input`.
    ///
    /// Returns the finished execution. On failure the execution stays
    /// queryable through `get_execution` with its diagnostics populated.
    pub async fn execute_workflow(
        &self,
        workflow_type: &str,
        input: &Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<WorkflowExecution, EngineError> {
        let definition = self
            .get_definition(workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_type.to_string()))?;

        let execution_id = options.execution_id.unwrap_or_else(Uuid::now_v7);
        let mut execution =
            WorkflowExecution::new(execution_id, &definition, input, options.initiated_by);
        if let Some(priority) = options.priority {
            execution.priority = priority;
        }
        execution.tags.extend(options.tags);
        execution.parent_execution_id = options.parent_execution_id;

        let slot = ExecutionSlot {
            record: Arc::new(RwLock::new(execution)),
            cancel: CancellationToken::new(),
        };
        match self.inner.executions.entry(execution_id) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateExecution(execution_id)),
            Entry::Vacant(entry) => {
                entry.insert(slot.clone());
            }
        }

        if let Some(parent_id) = options.parent_execution_id {
            self.link_child(parent_id, execution_id).await;
        }
        self.inner.stats.record_started(workflow_type).await;

        let span = tracing::info_span!(
            "workflow_execution",
            execution_id = %execution_id,
            workflow_type = workflow_type,
        );
        let outcome = self
            .drive(&definition, &slot, execution_id)
            .instrument(span)
            .await;

        self.inner.running.remove(&execution_id);
        self.persist(&slot).await;

        let execution = slot.record.read().await.clone();
        outcome.map(|()| execution)
    }

    async fn link_child(&self, parent_id: Uuid, child_id: Uuid) {
        let parent = self
            .inner
            .executions
            .get(&parent_id)
            .map(|slot| Arc::clone(&slot.record));
        match parent {
            Some(record) => record.write().await.add_child(child_id),
            None => tracing::debug!(parent_id = %parent_id, "parent execution not found, not linking"),
        }
    }

    fn acquire_permit(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
        let Some(limit) = definition.max_concurrent_executions() else {
            return Ok(None);
        };
        let semaphore = self
            .inner
            .semaphores
            .entry(definition.workflow_type().to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
            .clone();

        semaphore
            .try_acquire_owned()
            .map(Some)
            .map_err(|_| EngineError::ConcurrencyLimitReached {
                workflow_type: definition.workflow_type().to_string(),
                limit,
            })
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let workflow_type = definition.workflow_type();
        let ctx = slot.record.read().await.context.clone();

        let _permit = match self.acquire_permit(definition) {
            Ok(permit) => permit,
            Err(err) => {
                {
                    let mut exec = slot.record.write().await;
                    if exec.state == ExecutionState::Cancelled {
                        return Err(EngineError::Cancelled(execution_id));
                    }
                    exec.state = ExecutionState::Queued;
                }
                self.inner.stats.record_rejected(workflow_type).await;
                self.inner.events.publish(WorkflowEvent::ExecutionRejected {
                    execution_id,
                    workflow_type: workflow_type.to_string(),
                    limit: definition.max_concurrent_executions().unwrap_or_default(),
                });
                tracing::warn!(error = %err, "execution rejected by admission control");
                return Err(err);
            }
        };

        if let Err(reason) = self.run_validators(definition, &ctx).await {
            {
                let mut exec = slot.record.write().await;
                if exec.state == ExecutionState::Cancelled {
                    return Err(EngineError::Cancelled(execution_id));
                }
                exec.state = ExecutionState::Failed;
                exec.completed_at = Some(Utc::now());
                exec.add_error(format!("validation failed: {reason}"), None, ErrorSeverity::Error);
            }
            self.inner.stats.record_validation_failure(workflow_type).await;
            self.inner.events.publish(WorkflowEvent::ExecutionFailed {
                execution_id,
                workflow_type: workflow_type.to_string(),
                error: reason.clone(),
            });
            tracing::warn!(reason = reason.as_str(), "pre-execution validation failed");
            return Err(EngineError::ValidationFailed {
                workflow_type: workflow_type.to_string(),
                reason,
            });
        }

        let initiated_by = {
            let mut exec = slot.record.write().await;
            if exec.state == ExecutionState::Cancelled {
                return Err(EngineError::Cancelled(execution_id));
            }
            exec.state = ExecutionState::Running;
            exec.started_at = Some(Utc::now());
            exec.initiated_by.clone()
        };
        self.inner.running.insert(execution_id, workflow_type.to_string());
        self.inner.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_type: workflow_type.to_string(),
            initiated_by,
        });
        tracing::info!(steps = definition.steps().len(), "workflow execution started");

        let limit = definition.max_execution_time();
        let outcome =
            match tokio::time::timeout(limit, self.run_steps(definition, slot, &ctx, execution_id)).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(EngineError::WorkflowTimeout {
                    workflow_type: workflow_type.to_string(),
                    limit,
                }),
            };

        if slot.cancel.is_cancelled() {
            tracing::info!("execution cancelled, stopping without rollback");
            return Err(EngineError::Cancelled(execution_id));
        }

        match outcome {
            Ok(()) => self.complete(definition, slot, execution_id).await,
            Err(err) => Err(self.fail(definition, slot, &ctx, execution_id, err).await),
        }
    }

    async fn run_validators(
        &self,
        definition: &WorkflowDefinition,
        ctx: &WorkflowContext,
    ) -> Result<(), String> {
        let timeout = self.inner.config.validator_timeout();
        for (index, validator) in definition.validators().iter().enumerate() {
            match tokio::time::timeout(timeout, validator(ctx.clone())).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return Err(format!("validator #{index} rejected the input")),
                Ok(Err(e)) => return Err(format!("validator #{index} failed: {e:#}")),
                Err(_elapsed) => {
                    return Err(format!("validator #{index} timed out after {timeout:?}"));
                }
            }
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        ctx: &WorkflowContext,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let step_timeout = self.inner.config.default_step_timeout();

        for (index, step) in definition.steps().iter().enumerate() {
            if slot.cancel.is_cancelled() {
                return Err(EngineError::Cancelled(execution_id));
            }

            let name = step.name();
            {
                let mut exec = slot.record.write().await;
                exec.current_step_index = index;
                exec.current_step_name = Some(name.to_string());
            }

            let report = step.execute(ctx, execution_id, step_timeout, &self.inner.events).await;
            let metrics = report.metrics;
            let duration_ms = metrics.execution_time_ms;
            if let StepOutcome::Completed(value) = &report.outcome {
                ctx.insert(WorkflowContext::result_key(name), value.clone());
            }
            let context_size = ctx.size_bytes();

            let mut exec = slot.record.write().await;
            exec.metrics.context_size = context_size;
            exec.metrics.retry_count += metrics.retry_count;
            exec.metrics
                .step_metrics
                .insert(name.to_string(), metrics.clone());

            match report.outcome {
                StepOutcome::Completed(value) => {
                    exec.step_runtime.insert(
                        name.to_string(),
                        StepRuntime {
                            executed: true,
                            result: Some(value.clone()),
                            error: None,
                            metrics,
                        },
                    );
                    exec.executed_steps.push(name.to_string());

                    let completion = (!definition.on_step_complete_hooks().is_empty()).then(|| {
                        StepCompletion {
                            execution: exec.clone(),
                            step: name.to_string(),
                            result: value,
                        }
                    });
                    drop(exec);

                    self.inner.events.publish(WorkflowEvent::StepCompleted {
                        execution_id,
                        step: name.to_string(),
                        duration_ms,
                    });
                    tracing::debug!(step = name, duration_ms, "step completed");

                    if let Some(completion) = completion {
                        self.run_step_hooks(definition, slot, completion).await;
                    }
                }
                StepOutcome::Skipped => {
                    exec.step_runtime.insert(
                        name.to_string(),
                        StepRuntime {
                            metrics,
                            ..StepRuntime::default()
                        },
                    );
                    exec.skipped_steps.push(name.to_string());
                    drop(exec);

                    self.inner.events.publish(WorkflowEvent::StepSkipped {
                        execution_id,
                        step: name.to_string(),
                    });
                }
                StepOutcome::Failed(error) => {
                    exec.step_runtime.insert(
                        name.to_string(),
                        StepRuntime {
                            executed: false,
                            result: None,
                            error: Some(error.to_string()),
                            metrics,
                        },
                    );
                    exec.failed_steps.push(name.to_string());
                    self.inner.events.publish(WorkflowEvent::StepFailed {
                        execution_id,
                        step: name.to_string(),
                        error: error.to_string(),
                        required: step.is_required(),
                    });

                    if step.is_required() {
                        return Err(EngineError::StepFailed {
                            step: name.to_string(),
                            source: error,
                        });
                    }

                    tracing::warn!(step = name, error = %error, "optional step failed, continuing");
                    exec.add_warning(format!("optional step '{name}' failed: {error}"), Some(name));
                    exec.skipped_steps.push(name.to_string());
                }
            }
        }

        Ok(())
    }

    async fn run_step_hooks(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        completion: StepCompletion,
    ) {
        let timeout = self.inner.config.hook_timeout();
        for hook in definition.on_step_complete_hooks() {
            if let Err(reason) = call_hook(timeout, hook(completion.clone())).await {
                tracing::warn!(step = completion.step.as_str(), reason = reason.as_str(), "on_step_complete hook failed");
                slot.record
                    .write()
                    .await
                    .add_warning(format!("on_step_complete hook failed: {reason}"), Some(&completion.step));
            }
        }
    }

    async fn run_execution_hooks(&self, hooks: &[ExecutionHook], label: &str, slot: &ExecutionSlot) {
        if hooks.is_empty() {
            return;
        }
        let timeout = self.inner.config.hook_timeout();
        let execution = slot.record.read().await.clone();
        for hook in hooks {
            if let Err(reason) = call_hook(timeout, hook(execution.clone())).await {
                tracing::warn!(hook = label, reason = reason.as_str(), "lifecycle hook failed");
                slot.record
                    .write()
                    .await
                    .add_warning(format!("{label} hook failed: {reason}"), None);
            }
        }
    }

    async fn complete(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let (duration_ms, steps_executed) = {
            let mut exec = slot.record.write().await;
            if exec.state == ExecutionState::Cancelled {
                return Err(EngineError::Cancelled(execution_id));
            }
            exec.state = ExecutionState::Completed;
            exec.completed_at = Some(Utc::now());
            let total_steps = exec.total_steps;
            exec.current_step_index = total_steps;
            let duration_ms = elapsed_ms(&exec);
            let context_size = exec.context.size_bytes();
            let result = collect_results(&exec);
            exec.metrics.total_execution_time_ms = duration_ms;
            exec.metrics.context_size = context_size;
            exec.result = Some(result);
            (duration_ms, exec.executed_steps.len() as u32)
        };

        let workflow_type = definition.workflow_type();
        self.inner.stats.record_completed(workflow_type, duration_ms).await;
        self.inner.events.publish(WorkflowEvent::ExecutionCompleted {
            execution_id,
            workflow_type: workflow_type.to_string(),
            duration_ms,
            steps_executed,
        });
        tracing::info!(duration_ms, steps_executed, "workflow execution completed");

        self.run_execution_hooks(definition.on_complete_hooks(), "on_complete", slot)
            .await;
        Ok(())
    }

    /// Failure path. Returns the error the caller should see.
    async fn fail(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        ctx: &WorkflowContext,
        execution_id: Uuid,
        error: EngineError,
    ) -> EngineError {
        let (executed, runtimes) = {
            let mut exec = slot.record.write().await;
            if exec.state == ExecutionState::Cancelled {
                return EngineError::Cancelled(execution_id);
            }
            exec.state = ExecutionState::Failed;
            exec.completed_at = Some(Utc::now());
            let duration_ms = elapsed_ms(&exec);
            let context_size = exec.context.size_bytes();
            exec.metrics.total_execution_time_ms = duration_ms;
            exec.metrics.context_size = context_size;
            let step = match &error {
                EngineError::StepFailed { step, .. } => Some(step.clone()),
                _ => exec.current_step_name.clone(),
            };
            exec.add_error(error.to_string(), step.as_deref(), ErrorSeverity::Error);
            (exec.executed_steps.clone(), exec.step_runtime.clone())
        };

        let workflow_type = definition.workflow_type();
        self.inner.stats.record_failed(workflow_type, error.kind()).await;
        self.inner.events.publish(WorkflowEvent::ExecutionFailed {
            execution_id,
            workflow_type: workflow_type.to_string(),
            error: error.to_string(),
        });
        tracing::error!(error = %error, "workflow execution failed, rolling back");

        self.run_execution_hooks(definition.on_error_hooks(), "on_error", slot)
            .await;

        let steps_rolled_back = self
            .roll_back(definition, slot, ctx, &executed, &runtimes)
            .await;
        slot.record.write().await.state = ExecutionState::RolledBack;
        self.inner.events.publish(WorkflowEvent::ExecutionRolledBack {
            execution_id,
            steps_rolled_back,
        });
        tracing::info!(steps_rolled_back, "rollback finished");

        error
    }

    /// Undo executed steps in reverse order. Rollback errors become warnings.
    async fn roll_back(
        &self,
        definition: &WorkflowDefinition,
        slot: &ExecutionSlot,
        ctx: &WorkflowContext,
        executed: &[String],
        runtimes: &HashMap<String, StepRuntime>,
    ) -> u32 {
        let mut rolled_back = 0;
        for name in executed.iter().rev() {
            let Some(step) = definition.get_step(name) else {
                continue;
            };
            let timeout = step
                .timeout()
                .unwrap_or_else(|| self.inner.config.default_step_timeout());

            match step.rollback(ctx, runtimes.get(name), timeout).await {
                Ok(true) => {
                    rolled_back += 1;
                    tracing::debug!(step = name.as_str(), "step rolled back");
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(step = name.as_str(), error = %err, "rollback failed");
                    slot.record
                        .write()
                        .await
                        .add_warning(format!("rollback of step '{name}' failed: {err}"), Some(name));
                }
            }
        }
        rolled_back
    }

    async fn persist(&self, slot: &ExecutionSlot) {
        if !self.inner.config.enable_persistence {
            return;
        }
        let Some(store) = &self.inner.store else {
            return;
        };

        let snapshot = slot.record.read().await.snapshot();
        let key = snapshot_key(&snapshot.execution_id);
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = key.as_str(), error = %e, "failed to serialize execution snapshot");
                return;
            }
        };
        if let Err(e) = store
            .set_with_ttl(&key, &value, self.inner.config.persistence_ttl())
            .await
        {
            tracing::warn!(key = key.as_str(), error = %e, "failed to persist execution snapshot");
        }
    }

    // -- cancellation -------------------------------------------------------

    /// Mark an execution cancelled. Returns `false` if it is unknown or
    /// already terminal.
    ///
    /// Advisory only: a handler already running is not interrupted. The run
    /// stops before its next step and its executed steps are not rolled back.
    pub async fn cancel_execution(&self, execution_id: Uuid, reason: &str) -> bool {
        let Some(slot) = self.inner.executions.get(&execution_id).map(|s| s.value().clone()) else {
            return false;
        };

        let workflow_type = {
            let mut exec = slot.record.write().await;
            if exec.is_terminal() {
                return false;
            }
            exec.state = ExecutionState::Cancelled;
            exec.completed_at = Some(Utc::now());
            exec.add_error(format!("cancelled: {reason}"), None, ErrorSeverity::Error);
            exec.workflow_type.clone()
        };

        slot.cancel.cancel();
        self.inner.running.remove(&execution_id);
        self.inner.stats.record_cancelled(&workflow_type).await;
        self.inner.events.publish(WorkflowEvent::ExecutionCancelled {
            execution_id,
            reason: reason.to_string(),
        });
        tracing::info!(execution_id = %execution_id, reason, "execution cancelled");

        self.persist(&slot).await;
        true
    }

    // -- queries ------------------------------------------------------------

    /// Copy of a stored execution.
    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        let record = self
            .inner
            .executions
            .get(&execution_id)
            .map(|slot| Arc::clone(&slot.record))?;
        let execution = record.read().await.clone();
        Some(execution)
    }

    /// Executions of `workflow_type`, newest-started first.
    pub async fn get_executions_by_type(
        &self,
        workflow_type: &str,
        state: Option<ExecutionState>,
        limit: usize,
    ) -> Vec<WorkflowExecution> {
        let mut matches = Vec::new();
        for record in self.records() {
            let exec = record.read().await;
            if exec.workflow_type == workflow_type && state.is_none_or(|s| exec.state == s) {
                matches.push(exec.clone());
            }
        }
        matches.sort_by_key(|e| Reverse((e.started_at, e.created_at)));
        matches.truncate(limit);
        matches
    }

    /// Running aggregate plus live counts.
    pub async fn get_statistics(&self) -> EngineStatistics {
        let mut stats = self.inner.stats.snapshot().await;
        stats.registered_workflows = self.inner.registry.len();
        stats.running_executions = self.inner.running.len();
        stats.stored_executions = self.inner.executions.len();
        stats
    }

    pub fn running_executions(&self) -> usize {
        self.inner.running.len()
    }

    fn records(&self) -> Vec<Arc<RwLock<WorkflowExecution>>> {
        self.inner
            .executions
            .iter()
            .map(|entry| Arc::clone(&entry.value().record))
            .collect()
    }

    // -- housekeeping -------------------------------------------------------

    /// Evict the oldest terminal executions above `max_execution_history`.
    ///
    /// Returns the number evicted. Non-terminal executions are never evicted.
    pub async fn evict_history(&self) -> usize {
        let cap = self.inner.config.max_execution_history;
        let stored = self.inner.executions.len();
        if stored <= cap {
            return 0;
        }

        let mut terminal = Vec::new();
        for record in self.records() {
            let exec = record.read().await;
            if exec.is_terminal() {
                terminal.push((exec.completed_at, exec.execution_id));
            }
        }
        terminal.sort();

        let evicted = terminal
            .into_iter()
            .take(stored - cap)
            .filter(|(_, id)| self.inner.executions.remove(id).is_some())
            .count();

        if evicted > 0 {
            tracing::info!(evicted, retained = self.inner.executions.len(), "evicted execution history");
        }
        evicted
    }

    // -- blocking work ------------------------------------------------------

    /// Run blocking code on the engine's bounded worker pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.inner.blocking.run(f).await?)
    }
}

async fn call_hook(
    timeout: Duration,
    hook: impl Future<Output = anyhow::Result<()>>,
) -> Result<(), String> {
    match tokio::time::timeout(timeout, hook).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_elapsed) => Err(format!("timed out after {timeout:?}")),
    }
}

fn elapsed_ms(exec: &WorkflowExecution) -> u64 {
    exec.duration().map_or(0, |d| d.as_millis() as u64)
}

/// Result payload: executed step name -> step result.
fn collect_results(exec: &WorkflowExecution) -> Value {
    let results: Map<String, Value> = exec
        .executed_steps
        .iter()
        .filter_map(|name| {
            let result = exec.step_runtime.get(name)?.result.clone()?;
            Some((name.clone(), result))
        })
        .collect();
    Value::Object(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::Step;
    use hostelry_types::workflow::{ExecutionSnapshot, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn ok_step(name: &str) -> Step {
        Step::new(name, |_ctx| async move { Ok(json!("done")) })
    }

    fn single_step(workflow_type: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(workflow_type, "Test")
            .add_step(ok_step("only"))
            .unwrap()
    }

    /// Step that appends its name to `log` in its rollback handler.
    fn logged_step(name: &'static str, log: &Arc<StdMutex<Vec<String>>>) -> Step {
        let log = Arc::clone(log);
        Step::new(name, |_ctx| async move { Ok(json!(true)) }).with_rollback(move |_ctx| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            }
        })
    }

    fn failing_step(name: &str, message: &'static str) -> Step {
        Step::new(name, move |_ctx| async move { Err(anyhow::anyhow!(message)) })
            .with_retry(RetryPolicy::none())
    }

    fn onboard_admin(create_account_fails: bool) -> WorkflowDefinition {
        let create_account = Step::new("create_account", move |ctx: WorkflowContext| async move {
            if create_account_fails {
                anyhow::bail!("account service unavailable");
            }
            ctx.insert("account_id", json!("acc-1"));
            Ok(json!({"account_id": "acc-1"}))
        })
        .with_retries(2, Duration::from_millis(1), 1.0);

        let send_welcome_email = failing_step("send_welcome_email", "smtp refused").optional();

        WorkflowDefinition::new("onboard_admin", "Onboard Admin")
            .add_step(create_account)
            .unwrap()
            .add_step(send_welcome_email)
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_and_original_kept() {
        let engine = WorkflowEngine::new(config());
        engine
            .register_workflow(WorkflowDefinition::new("checkin", "Original").add_step(ok_step("a")).unwrap())
            .unwrap();

        let err = engine
            .register_workflow(WorkflowDefinition::new("checkin", "Replacement").add_step(ok_step("b")).unwrap())
            .unwrap_err();

        assert!(matches!(err, EngineError::AlreadyRegistered(ref t) if t == "checkin"));
        let kept = engine.get_definition("checkin").unwrap();
        assert_eq!(kept.name(), "Original");
        assert!(kept.get_step("a").is_some());
        assert_eq!(engine.registered_workflows(), vec!["checkin"]);
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected() {
        let engine = WorkflowEngine::new(config());
        let err = engine
            .register_workflow(WorkflowDefinition::new("empty", "Empty"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn unknown_workflow_type_fails() {
        let engine = WorkflowEngine::new(config());
        let err = engine
            .execute_workflow("nope", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownWorkflow(_)));
    }

    #[tokio::test]
    async fn onboard_admin_completes_despite_optional_failure() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(onboard_admin(false)).unwrap();

        let exec = engine
            .execute_workflow("onboard_admin", &Map::new(), ExecutionOptions::new().initiated_by("root"))
            .await
            .unwrap();

        assert_eq!(exec.state, ExecutionState::Completed);
        assert_eq!(exec.executed_steps, vec!["create_account"]);
        assert_eq!(exec.skipped_steps, vec!["send_welcome_email"]);
        assert_eq!(exec.failed_steps, vec!["send_welcome_email"]);
        assert_eq!(exec.warnings.len(), 1);
        assert_eq!(exec.warnings[0].step.as_deref(), Some("send_welcome_email"));
        assert!(exec.errors.is_empty());
        assert_eq!(exec.context.get_str("account_id").as_deref(), Some("acc-1"));
        assert_eq!(exec.context.get("create_account_result"), Some(json!({"account_id": "acc-1"})));
        assert_eq!(exec.result, Some(json!({"create_account": {"account_id": "acc-1"}})));
        assert_eq!(exec.progress_percentage(), 100.0);
    }

    #[tokio::test]
    async fn onboard_admin_rolls_back_when_account_creation_fails() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(onboard_admin(true)).unwrap();
        let id = Uuid::now_v7();

        let err = engine
            .execute_workflow("onboard_admin", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();

        assert_eq!(
            err.handler_error().map(|e| e.to_string()).as_deref(),
            Some("account service unavailable")
        );
        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::RolledBack);
        assert_eq!(exec.failed_steps, vec!["create_account"]);
        assert!(exec.executed_steps.is_empty());
        assert_eq!(exec.errors.len(), 1);
        assert!(exec.errors[0].message.contains("account service unavailable"));
        assert_eq!(exec.metrics.retry_count, 2);
        assert_eq!(exec.metrics.step_metrics["create_account"].attempts, 3);
    }

    #[tokio::test]
    async fn required_failure_rolls_back_executed_steps_in_reverse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let definition = WorkflowDefinition::new("booking", "Booking")
            .add_step(logged_step("reserve_bed", &log))
            .unwrap()
            .add_step(logged_step("hold_deposit", &log))
            .unwrap()
            .add_step(ok_step("skip_me").when(|_ctx| false))
            .unwrap()
            .add_step(failing_step("confirm", "payment declined"))
            .unwrap()
            .add_step(logged_step("never_runs", &log))
            .unwrap();

        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();

        let err = engine
            .execute_workflow("booking", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { ref step, .. } if step == "confirm"));

        assert_eq!(*log.lock().unwrap(), vec!["hold_deposit", "reserve_bed"]);
        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::RolledBack);
        assert_eq!(exec.executed_steps, vec!["reserve_bed", "hold_deposit"]);
        assert_eq!(exec.skipped_steps, vec!["skip_me"]);
        assert_eq!(exec.current_step_name.as_deref(), Some("confirm"));
        assert_eq!(exec.progress_percentage(), 60.0);
    }

    #[tokio::test]
    async fn rollback_errors_become_warnings_and_walk_continues() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let broken = Step::new("broken_undo", |_ctx| async move { Ok(json!(1)) })
            .with_rollback(|_ctx| async move { anyhow::bail!("ledger locked") });
        let definition = WorkflowDefinition::new("t", "T")
            .add_step(logged_step("first", &log))
            .unwrap()
            .add_step(broken)
            .unwrap()
            .add_step(failing_step("last", "boom"))
            .unwrap();

        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();
        engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();

        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::RolledBack);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert!(exec.warnings.iter().any(|w| w.message.contains("ledger locked")));
    }

    #[tokio::test]
    async fn optional_failure_does_not_roll_back() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let definition = WorkflowDefinition::new("t", "T")
            .add_step(logged_step("first", &log))
            .unwrap()
            .add_step(failing_step("nice_to_have", "nope").optional())
            .unwrap()
            .add_step(ok_step("last"))
            .unwrap();

        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let exec = engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();

        assert_eq!(exec.state, ExecutionState::Completed);
        assert_eq!(exec.executed_steps, vec!["first", "last"]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_count_metric_matches_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let step = Step::new("flaky", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("still down")
            }
        })
        .with_retries(4, Duration::from_millis(1), 1.0);
        let engine = WorkflowEngine::new(config());
        engine
            .register_workflow(WorkflowDefinition::new("t", "T").add_step(step).unwrap())
            .unwrap();
        let id = Uuid::now_v7();

        engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.metrics.retry_count, 4);
        assert_eq!(exec.step_runtime["flaky"].error.as_deref(), Some("still down"));
    }

    #[tokio::test]
    async fn concurrency_limit_rejects_extra_execution_as_queued() {
        const LIMIT: u32 = 2;
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();

        let held = {
            let gate = Arc::clone(&gate);
            Step::new("wait_for_gate", move |_ctx| {
                let gate = Arc::clone(&gate);
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    gate.acquire().await?.forget();
                    Ok(json!("released"))
                }
            })
        };
        let engine = WorkflowEngine::new(config());
        engine
            .register_workflow(
                WorkflowDefinition::new("allocation", "Bed Allocation")
                    .with_max_concurrent_executions(LIMIT)
                    .add_step(held)
                    .unwrap(),
            )
            .unwrap();

        let mut runs = Vec::new();
        for _ in 0..LIMIT {
            let engine = engine.clone();
            runs.push(tokio::spawn(async move {
                engine
                    .execute_workflow("allocation", &Map::new(), ExecutionOptions::new())
                    .await
            }));
        }
        for _ in 0..LIMIT {
            started_rx.recv().await.unwrap();
        }
        assert_eq!(engine.running_executions(), LIMIT as usize);

        let rejected_id = Uuid::now_v7();
        let err = engine
            .execute_workflow("allocation", &Map::new(), ExecutionOptions::new().execution_id(rejected_id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyLimitReached { limit: LIMIT, .. }));
        assert_eq!(
            engine.get_execution(rejected_id).await.unwrap().state,
            ExecutionState::Queued
        );

        gate.add_permits(LIMIT as usize);
        for run in runs {
            let exec = run.await.unwrap().unwrap();
            assert_eq!(exec.state, ExecutionState::Completed);
        }

        let stats = engine.get_statistics().await;
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.completed, LIMIT as u64);
        assert_eq!(stats.running_executions, 0);
    }

    #[tokio::test]
    async fn validator_failure_runs_no_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let step = Step::new("charge", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let definition = WorkflowDefinition::new("payment", "Payment")
            .add_validator(|ctx: WorkflowContext| async move { Ok(ctx.contains_key("amount")) })
            .add_step(step)
            .unwrap();
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();

        let err = engine
            .execute_workflow("payment", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ValidationFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Failed);
        assert!(exec.executed_steps.is_empty());
        assert_eq!(engine.get_statistics().await.validation_failures, 1);
    }

    #[tokio::test]
    async fn validator_error_and_timeout_fail_execution() {
        let mut config = config();
        config.validator_timeout_secs = 0;
        let engine = WorkflowEngine::new(config);
        engine
            .register_workflow(
                WorkflowDefinition::new("slow", "Slow")
                    .add_validator(|_ctx| async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(true)
                    })
                    .add_step(ok_step("a"))
                    .unwrap(),
            )
            .unwrap();
        engine
            .register_workflow(
                WorkflowDefinition::new("broken", "Broken")
                    .add_validator(|_ctx| async move { anyhow::bail!("lookup failed") })
                    .add_step(ok_step("a"))
                    .unwrap(),
            )
            .unwrap();

        let err = engine
            .execute_workflow("slow", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let err = engine
            .execute_workflow("broken", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("lookup failed"));
    }

    #[tokio::test]
    async fn context_is_a_copy_of_the_input() {
        let engine = WorkflowEngine::new(config());
        engine
            .register_workflow(
                WorkflowDefinition::new("t", "T")
                    .add_step(Step::new("mutate", |ctx: WorkflowContext| async move {
                        ctx.insert("guest", json!("changed"));
                        Ok(Value::Null)
                    }))
                    .unwrap(),
            )
            .unwrap();

        let mut input = Map::new();
        input.insert("guest".into(), json!("original"));
        let exec = engine
            .execute_workflow("t", &input, ExecutionOptions::new())
            .await
            .unwrap();

        assert_eq!(input["guest"], json!("original"));
        assert_eq!(exec.context.get_str("guest").as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn steps_see_earlier_results_in_context() {
        let definition = WorkflowDefinition::new("t", "T")
            .add_step(Step::new("quote", |_ctx| async move { Ok(json!(120)) }))
            .unwrap()
            .add_step(Step::new("invoice", |ctx: WorkflowContext| async move {
                let quote = ctx.get("quote_result").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(quote * 2))
            }))
            .unwrap()
            .add_step(ok_step("vip_only").when_expr("context.tier == 'vip'"))
            .unwrap();
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();

        let exec = engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();

        assert_eq!(exec.context.get("invoice_result"), Some(json!(240)));
        assert_eq!(exec.skipped_steps, vec!["vip_only"]);
    }

    #[tokio::test]
    async fn duplicate_execution_id_is_rejected() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(single_step("t")).unwrap();
        let id = Uuid::now_v7();

        engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap();
        let err = engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateExecution(dup) if dup == id));
    }

    #[tokio::test]
    async fn child_is_linked_to_parent() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(single_step("parent")).unwrap();
        engine.register_workflow(single_step("child")).unwrap();

        let parent = engine
            .execute_workflow("parent", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();
        let child = engine
            .execute_workflow(
                "child",
                &Map::new(),
                ExecutionOptions::new()
                    .parent(parent.execution_id)
                    .priority(WorkflowPriority::High)
                    .tag("nested"),
            )
            .await
            .unwrap();

        let parent = engine.get_execution(parent.execution_id).await.unwrap();
        assert_eq!(parent.child_execution_ids, vec![child.execution_id]);
        assert_eq!(child.parent_execution_id, Some(parent.execution_id));
        assert_eq!(child.priority, WorkflowPriority::High);
        assert!(child.has_tag("nested"));
    }

    #[tokio::test]
    async fn workflow_time_budget_is_enforced_with_rollback() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let slow = Step::new("slow", |_ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let definition = WorkflowDefinition::new("t", "T")
            .with_max_execution_time(Duration::from_millis(50))
            .add_step(logged_step("first", &log))
            .unwrap()
            .add_step(slow)
            .unwrap();
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();

        let err = engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::WorkflowTimeout { .. }));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::RolledBack);
        assert_eq!(exec.errors[0].step.as_deref(), Some("slow"));
        assert_eq!(engine.get_statistics().await.error_types["workflow_timeout"], 1);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_step_without_rollback() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let started_tx = Arc::new(StdMutex::new(Some(started_tx)));

        let waiting = {
            let gate = Arc::clone(&gate);
            Step::new("await_approval", move |_ctx| {
                let gate = Arc::clone(&gate);
                let started_tx = Arc::clone(&started_tx);
                async move {
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    gate.notified().await;
                    Ok(Value::Null)
                }
            })
        };
        let definition = WorkflowDefinition::new("approval", "Approval")
            .add_step(logged_step("reserve", &log))
            .unwrap()
            .add_step(waiting)
            .unwrap()
            .add_step(logged_step("confirm", &log))
            .unwrap();
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_workflow("approval", &Map::new(), ExecutionOptions::new().execution_id(id))
                    .await
            })
        };
        started_rx.await.unwrap();

        assert!(engine.cancel_execution(id, "guest withdrew").await);
        assert!(!engine.cancel_execution(id, "again").await);
        gate.notify_one();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(c) if c == id));

        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Cancelled);
        assert_eq!(exec.executed_steps, vec!["reserve", "await_approval"]);
        assert!(log.lock().unwrap().is_empty());
        assert!(exec.errors[0].message.contains("guest withdrew"));
        assert_eq!(engine.get_statistics().await.cancelled, 1);
    }

    type StartSignal = Arc<StdMutex<Option<tokio::sync::oneshot::Sender<()>>>>;

    /// Oneshot that fires the first time `started` is called.
    fn start_signal() -> (StartSignal, tokio::sync::oneshot::Receiver<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Arc::new(StdMutex::new(Some(tx))), rx)
    }

    fn started(signal: &StartSignal) {
        if let Some(tx) = signal.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    #[tokio::test]
    async fn running_execution_reports_elapsed_duration() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (signal, started_rx) = start_signal();
        let scan_id = {
            let gate = Arc::clone(&gate);
            Step::new("scan_id", move |_ctx| {
                let gate = Arc::clone(&gate);
                let signal = Arc::clone(&signal);
                async move {
                    started(&signal);
                    gate.notified().await;
                    Ok(Value::Null)
                }
            })
        };
        let definition = WorkflowDefinition::new("checkin", "Check-in")
            .add_step(scan_id)
            .unwrap();
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_workflow("checkin", &Map::new(), ExecutionOptions::new().execution_id(id))
                    .await
            })
        };
        started_rx.await.unwrap();

        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Running);
        assert!(exec.duration().is_some());
        assert!(exec.snapshot().duration_secs.is_some());

        gate.notify_one();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_during_validation_is_not_overwritten() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (signal, started_rx) = start_signal();
        let validator_gate = Arc::clone(&gate);
        let definition = WorkflowDefinition::new("refund", "Refund")
            .add_validator(move |_ctx| {
                let gate = Arc::clone(&validator_gate);
                let signal = Arc::clone(&signal);
                async move {
                    started(&signal);
                    gate.notified().await;
                    Ok(false)
                }
            })
            .add_step(ok_step("pay_out"))
            .unwrap();
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_workflow("refund", &Map::new(), ExecutionOptions::new().execution_id(id))
                    .await
            })
        };
        started_rx.await.unwrap();

        assert!(engine.cancel_execution(id, "duplicate request").await);
        gate.notify_one();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(c) if c == id));

        let exec = engine.get_execution(id).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Cancelled);
        assert!(exec.executed_steps.is_empty());

        let stats = engine.get_statistics().await;
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.validation_failures, 0);
    }

    #[tokio::test]
    async fn context_size_is_sampled_after_each_step() {
        let sizes = Arc::new(StdMutex::new(Vec::new()));
        let recorded = Arc::clone(&sizes);
        let definition = WorkflowDefinition::new("allocate", "Allocate")
            .add_step(ok_step("pick_room"))
            .unwrap()
            .add_step(Step::new("pick_bed", |ctx: WorkflowContext| async move {
                ctx.insert("bed_notes", json!("lower bunk, near the window, away from the door"));
                Ok(json!("B-4"))
            }))
            .unwrap()
            .on_step_complete(move |completion| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded
                        .lock()
                        .unwrap()
                        .push(completion.execution.metrics.context_size);
                    Ok(())
                }
            });
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();

        let exec = engine
            .execute_workflow("allocate", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();

        let sizes = sizes.lock().unwrap().clone();
        assert_eq!(sizes.len(), 2);
        assert!(sizes[0] > 0);
        assert!(sizes[1] > sizes[0]);
        assert_eq!(exec.metrics.context_size, exec.context.size_bytes());
    }

    #[tokio::test]
    async fn cancel_unknown_or_finished_returns_false() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(single_step("t")).unwrap();
        assert!(!engine.cancel_execution(Uuid::now_v7(), "nothing").await);

        let exec = engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();
        assert!(!engine.cancel_execution(exec.execution_id, "late").await);
    }

    #[tokio::test]
    async fn history_eviction_keeps_newest_terminal_executions() {
        const CAP: usize = 4;
        let mut config = config();
        config.max_execution_history = CAP;
        let engine = WorkflowEngine::new(config);
        engine.register_workflow(single_step("t")).unwrap();

        let mut ids = Vec::new();
        for _ in 0..CAP + 5 {
            let exec = engine
                .execute_workflow("t", &Map::new(), ExecutionOptions::new())
                .await
                .unwrap();
            ids.push(exec.execution_id);
        }

        assert_eq!(engine.evict_history().await, 5);
        assert_eq!(engine.get_statistics().await.stored_executions, CAP);
        for id in &ids[..5] {
            assert!(engine.get_execution(*id).await.is_none());
        }
        for id in &ids[5..] {
            assert!(engine.get_execution(*id).await.is_some());
        }
        assert_eq!(engine.evict_history().await, 0);
    }

    #[tokio::test]
    async fn executions_by_type_newest_first_with_filter() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(single_step("ok")).unwrap();
        engine
            .register_workflow(
                WorkflowDefinition::new("bad", "Bad")
                    .add_step(failing_step("x", "no"))
                    .unwrap(),
            )
            .unwrap();

        let first = engine.execute_workflow("ok", &Map::new(), ExecutionOptions::new()).await.unwrap();
        let second = engine.execute_workflow("ok", &Map::new(), ExecutionOptions::new()).await.unwrap();
        let _ = engine.execute_workflow("bad", &Map::new(), ExecutionOptions::new()).await;

        let listed = engine.get_executions_by_type("ok", None, 10).await;
        let ids: Vec<Uuid> = listed.iter().map(|e| e.execution_id).collect();
        assert_eq!(ids, vec![second.execution_id, first.execution_id]);

        assert_eq!(engine.get_executions_by_type("ok", None, 1).await.len(), 1);
        assert_eq!(
            engine
                .get_executions_by_type("bad", Some(ExecutionState::RolledBack), 10)
                .await
                .len(),
            1
        );
        assert!(
            engine
                .get_executions_by_type("bad", Some(ExecutionState::Completed), 10)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn hooks_run_and_hook_errors_become_warnings() {
        let completed = Arc::new(AtomicU32::new(0));
        let step_hooks = Arc::new(AtomicU32::new(0));
        let on_complete = Arc::clone(&completed);
        let on_step = Arc::clone(&step_hooks);

        let definition = WorkflowDefinition::new("t", "T")
            .add_step(ok_step("a"))
            .unwrap()
            .add_step(ok_step("b"))
            .unwrap()
            .on_step_complete(move |done: StepCompletion| {
                let on_step = Arc::clone(&on_step);
                async move {
                    assert!(done.execution.executed_steps.contains(&done.step));
                    on_step.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_complete(move |exec: WorkflowExecution| {
                let on_complete = Arc::clone(&on_complete);
                async move {
                    assert_eq!(exec.state, ExecutionState::Completed);
                    on_complete.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_complete(|_exec| async move { anyhow::bail!("audit log offline") });

        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();
        let id = Uuid::now_v7();
        let exec = engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new().execution_id(id))
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Completed);

        assert_eq!(step_hooks.load(Ordering::SeqCst), 2);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        let stored = engine.get_execution(id).await.unwrap();
        assert_eq!(stored.state, ExecutionState::Completed);
        assert!(stored.warnings.iter().any(|w| w.message.contains("audit log offline")));
    }

    #[tokio::test]
    async fn on_error_hook_sees_failed_state() {
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        let definition = WorkflowDefinition::new("t", "T")
            .add_step(failing_step("x", "boom"))
            .unwrap()
            .on_error(move |exec: WorkflowExecution| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().unwrap() = Some(exec.state);
                    Ok(())
                }
            });
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(definition).unwrap();

        engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap_err();
        assert_eq!(*seen.lock().unwrap(), Some(ExecutionState::Failed));
    }

    #[tokio::test]
    async fn terminal_snapshot_is_persisted() {
        let engine = WorkflowEngine::with_persistence(config(), MemoryKvStore::new());
        engine.register_workflow(onboard_admin(false)).unwrap();

        let exec = engine
            .execute_workflow("onboard_admin", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();

        let store = engine.store().unwrap();
        let value = store
            .get(&snapshot_key(&exec.execution_id))
            .await
            .unwrap()
            .unwrap();
        let snapshot: ExecutionSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(snapshot.state, ExecutionState::Completed);
        assert_eq!(snapshot.executed_steps, vec!["create_account"]);
        assert_eq!(snapshot.warnings.len(), 1);
    }

    #[tokio::test]
    async fn persistence_can_be_disabled() {
        let mut config = config();
        config.enable_persistence = false;
        let engine = WorkflowEngine::with_persistence(config, MemoryKvStore::new());
        engine.register_workflow(single_step("t")).unwrap();

        engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();
        assert!(engine.store().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_are_published_in_order() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(single_step("t")).unwrap();
        let mut rx = engine.subscribe();

        engine
            .execute_workflow("t", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::ExecutionStarted { .. }));
        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::StepCompleted { ref step, .. } if step == "only"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::ExecutionCompleted { steps_executed: 1, .. }
        ));
    }

    #[tokio::test]
    async fn start_and_stop_housekeeping() {
        let mut config = config();
        config.cleanup_interval_secs = 3600;
        let engine = WorkflowEngine::new(config);
        engine.start().await;
        engine.start().await;
        engine.stop().await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn run_blocking_offloads_work() {
        let engine = WorkflowEngine::new(config());
        let sum = engine.run_blocking(|| (1..=10).sum::<u32>()).await.unwrap();
        assert_eq!(sum, 55);
    }

    #[tokio::test]
    async fn statistics_track_outcomes_by_type() {
        let engine = WorkflowEngine::new(config());
        engine.register_workflow(onboard_admin(false)).unwrap();
        engine
            .execute_workflow("onboard_admin", &Map::new(), ExecutionOptions::new())
            .await
            .unwrap();

        let stats = engine.get_statistics().await;
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.registered_workflows, 1);
        assert_eq!(stats.by_workflow_type["onboard_admin"].completed, 1);
    }
}
