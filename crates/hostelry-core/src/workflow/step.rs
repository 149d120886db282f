//! Workflow steps: handler plus retry/timeout/condition/rollback policy.
//!
//! A `Step` is a stateless descriptor owned by a registered definition and
//! shared by every execution of it. Anything that happens during a run
//! (executed flag, result, last error, metrics) is recorded in the
//! execution's [`StepRuntime`] map, never on the step itself.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use hostelry_types::event::WorkflowEvent;
use hostelry_types::workflow::{RetryPolicy, StepMetrics};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::bus::EventBus;

use super::context::WorkflowContext;
use super::expression::{ConditionEvaluator, ExpressionError};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

pub type StepFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Step body: receives the shared context, returns the step result.
pub type StepHandler = Arc<dyn Fn(WorkflowContext) -> StepFuture + Send + Sync>;

pub type RollbackFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Compensating action run when a later required step fails.
pub type RollbackHandler = Arc<dyn Fn(WorkflowContext) -> RollbackFuture + Send + Sync>;

/// Post-condition on a successful handler result. `false` fails the attempt.
pub type ResultValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Precondition deciding whether the step runs at all.
#[derive(Clone)]
pub enum StepCondition {
    Predicate(Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>),
    /// JEXL expression over `{"context": ...}`.
    Expression(String),
}

impl std::fmt::Debug for StepCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepCondition::Predicate(_) => write!(f, "Predicate(..)"),
            StepCondition::Expression(source) => write!(f, "Expression({source:?})"),
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a step attempt (or rollback) failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The handler itself returned an error.
    #[error(transparent)]
    Handler(anyhow::Error),

    #[error("step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("step '{step}' result rejected by validator")]
    ResultRejected { step: String },

    #[error("condition for step '{step}' could not be evaluated: {source}")]
    Condition {
        step: String,
        #[source]
        source: ExpressionError,
    },
}

impl StepError {
    /// The handler's own error, if this failure came from the handler.
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            StepError::Handler(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-execution run state
// ---------------------------------------------------------------------------

/// Run state of one step within one execution.
#[derive(Debug, Clone, Default)]
pub struct StepRuntime {
    /// The handler completed successfully (rollback is only run when set).
    pub executed: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metrics: StepMetrics,
}

/// Outcome of driving a step through its attempt loop.
#[derive(Debug)]
pub enum StepOutcome {
    Completed(Value),
    /// Precondition evaluated false; nothing ran.
    Skipped,
    Failed(StepError),
}

#[derive(Debug)]
pub struct StepReport {
    pub outcome: StepOutcome,
    pub metrics: StepMetrics,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of work in a workflow definition.
#[derive(Clone)]
pub struct Step {
    name: String,
    handler: StepHandler,
    required: bool,
    rollback: Option<RollbackHandler>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    condition: Option<StepCondition>,
    result_validator: Option<ResultValidator>,
    tags: BTreeSet<String>,
}

impl Step {
    /// Create a required step with the default retry policy.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
            required: true,
            rollback: None,
            timeout: None,
            retry: RetryPolicy::default(),
            condition: None,
            result_validator: None,
            tags: BTreeSet::new(),
        }
    }

    /// Failures of an optional step become warnings instead of failing the run.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move |ctx| rollback(ctx).boxed()));
        self
    }

    /// Per-attempt timeout (engine default when unset).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_retries(self, retry_count: u32, retry_delay: Duration, backoff_multiplier: f64) -> Self {
        self.with_retry(RetryPolicy {
            retry_count,
            retry_delay_ms: retry_delay.as_millis() as u64,
            backoff_multiplier,
        })
    }

    /// Run only when `predicate` returns true.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(StepCondition::Predicate(Arc::new(predicate)));
        self
    }

    /// Run only when the JEXL `expression` is truthy.
    pub fn when_expr(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(StepCondition::Expression(expression.into()));
        self
    }

    pub fn validate_result<V>(mut self, validator: V) -> Self
    where
        V: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.result_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    fn should_run(&self, ctx: &WorkflowContext) -> Result<bool, StepError> {
        match &self.condition {
            None => Ok(true),
            Some(StepCondition::Predicate(predicate)) => Ok(predicate(ctx)),
            Some(StepCondition::Expression(source)) => ConditionEvaluator::new()
                .evaluate_in_context(source, ctx)
                .map_err(|e| StepError::Condition {
                    step: self.name.clone(),
                    source: e,
                }),
        }
    }

    /// Drive the step through its attempt loop.
    ///
    /// The precondition is evaluated at the start of each attempt until it
    /// first holds; an evaluation error fails that attempt and is retried.
    ///
    /// Up to `retry_count + 1` attempts, each under the step timeout (or
    /// `default_timeout`). Between attempts the task sleeps for the policy's
    /// backoff. Never panics or returns early with `?`: every failure ends up
    /// in the report's outcome.
    pub async fn execute(
        &self,
        ctx: &WorkflowContext,
        execution_id: Uuid,
        default_timeout: Duration,
        events: &EventBus,
    ) -> StepReport {
        let clock = Instant::now();
        let mut metrics = StepMetrics {
            started_at: Some(Utc::now()),
            ..StepMetrics::default()
        };

        let outcome = self
            .attempt_loop(ctx, execution_id, default_timeout, events, &mut metrics)
            .await;

        metrics.retry_count = metrics.attempts.saturating_sub(1);
        metrics.execution_time_ms = clock.elapsed().as_millis() as u64;
        metrics.completed_at = Some(Utc::now());

        StepReport { outcome, metrics }
    }

    async fn attempt_loop(
        &self,
        ctx: &WorkflowContext,
        execution_id: Uuid,
        default_timeout: Duration,
        events: &EventBus,
        metrics: &mut StepMetrics,
    ) -> StepOutcome {
        let timeout = self.timeout.unwrap_or(default_timeout);
        let mut attempt = 0u32;
        let mut condition_passed = false;

        loop {
            attempt += 1;
            metrics.attempts = attempt;

            let condition = if condition_passed { Ok(true) } else { self.should_run(ctx) };
            let error = match condition {
                Ok(false) => {
                    // Evaluations that errored still count as attempts.
                    metrics.attempts = attempt - 1;
                    tracing::debug!(execution_id = %execution_id, step = self.name.as_str(), "precondition false, skipping step");
                    return StepOutcome::Skipped;
                }
                Err(e) => e,
                Ok(true) => {
                    condition_passed = true;
                    tracing::debug!(
                        execution_id = %execution_id,
                        step = self.name.as_str(),
                        attempt,
                        "running step attempt"
                    );

                    match tokio::time::timeout(timeout, (self.handler)(ctx.clone())).await {
                        Ok(Ok(value)) => match &self.result_validator {
                            Some(validator) if !validator(&value) => StepError::ResultRejected {
                                step: self.name.clone(),
                            },
                            _ => return StepOutcome::Completed(value),
                        },
                        Ok(Err(e)) => StepError::Handler(e),
                        Err(_elapsed) => StepError::Timeout {
                            step: self.name.clone(),
                            timeout,
                        },
                    }
                }
            };

            if !RetryHandler::should_retry(&self.retry, attempt) {
                return StepOutcome::Failed(error);
            }

            let delay = RetryHandler::backoff_delay(&self.retry, attempt);
            tracing::warn!(
                execution_id = %execution_id,
                step = self.name.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step attempt failed, retrying"
            );
            events.publish(WorkflowEvent::StepRetrying {
                execution_id,
                step: self.name.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            tokio::time::sleep(delay).await;
        }
    }

    /// Run the compensating action if this step executed in the given run.
    ///
    /// Returns `Ok(false)` when there is nothing to undo (no rollback handler,
    /// or the step never completed).
    pub async fn rollback(
        &self,
        ctx: &WorkflowContext,
        runtime: Option<&StepRuntime>,
        timeout: Duration,
    ) -> Result<bool, StepError> {
        let Some(rollback) = &self.rollback else {
            return Ok(false);
        };
        if !runtime.is_some_and(|rt| rt.executed) {
            return Ok(false);
        }

        match tokio::time::timeout(timeout, rollback(ctx.clone())).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(StepError::Handler(e)),
            Err(_elapsed) => Err(StepError::Timeout {
                step: self.name.clone(),
                timeout,
            }),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("has_rollback", &self.rollback.is_some())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("condition", &self.condition)
            .field("tags", &self.tags)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
