//! Retry decisions and exponential backoff for step attempts.
//!
//! Stateless: all logic is in associated functions that take the policy as
//! a parameter, so the same `Step` can be driven by many executions at once.

use std::time::Duration;

use hostelry_types::workflow::RetryPolicy;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Total attempts a step gets under `policy`.
    pub fn max_attempts(policy: &RetryPolicy) -> u32 {
        policy.retry_count.saturating_add(1)
    }

    /// Whether another attempt should follow failed attempt `attempt`.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Sleep before the attempt following failed attempt `attempt`.
    ///
    /// `retry_delay * backoff^(attempt-1)`, capped at [`MAX_BACKOFF`].
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = policy.backoff_multiplier.max(0.0).powi(exponent);
        let millis = policy.retry_delay_ms as f64 * factor;

        if !millis.is_finite() || millis >= MAX_BACKOFF.as_millis() as f64 {
            return MAX_BACKOFF;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
