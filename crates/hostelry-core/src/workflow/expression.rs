//! JEXL expression evaluator for step `when` conditions.
//!
//! Wraps `jexl_eval::Evaluator` with a few standard transforms. Expressions
//! see the execution context under the `context` key, e.g.
//! `context.role == 'warden' && context.beds|length > 0`.
//!
//! Context values are always passed as the evaluation context object, never
//! interpolated into expression strings.

use serde_json::{Value, json};

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms pre-registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    ///
    /// The `context` must be a JSON object.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(value_to_bool(&result))
    }

    /// Evaluate an expression against a live execution context.
    pub fn evaluate_in_context(
        &self,
        expression: &str,
        ctx: &WorkflowContext,
    ) -> Result<bool, ExpressionError> {
        let wrapped = json!({ "context": ctx.to_value() });
        self.evaluate_bool(expression, &wrapped)
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
