//! Retry/backoff policy evaluator.
//!
//! Stateless: every decision is a function of the policy, the retry state
//! persisted on the try node, the error and the current time. The delay
//! formulas for a failed attempt with zero-based index `i` are:
//! - constant: `base`
//! - linear: `base * (1 + i)`
//! - exponential: `base * 2^i`
//!
//! plus a uniform jitter sample when the policy declares one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use waypost_types::error::{ErrorKind, WorkflowError};
use waypost_types::instance::RetryState;
use waypost_types::retry::{BackoffStrategy, RetryPolicy};

use super::expression::{ExpressionError, ExpressionEvaluator};

/// Why no further attempt is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Validation and configuration errors are never retried.
    NotRetryable,
    ExceptWhen,
    WhenFalse,
    AttemptsExhausted,
    DurationExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enter the body after `delay` as attempt `attempt`.
    Retry { attempt: u32, delay: Duration },
    Stop(StopReason),
}

/// Stateless retry policy evaluator.
pub struct RetryEvaluator;

impl RetryEvaluator {
    /// Delay after the failed attempt `attempt`, without jitter.
    pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = policy.delay.to_std();
        match policy.backoff {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Exponential => exponential_backoff(base, attempt),
        }
    }

    /// Delay after the failed attempt `attempt`, jitter included.
    pub fn delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = Self::base_delay(policy, attempt);
        match &policy.jitter {
            Some(jitter) => {
                let from = jitter.from.total_millis();
                let to = jitter.to.total_millis().max(from);
                let sample = rand::thread_rng().gen_range(from..=to);
                base.saturating_add(Duration::from_millis(sample))
            }
            None => base,
        }
    }

    /// Decide whether the failed attempt recorded in `state` is retried.
    ///
    /// `env` is the evaluation environment with the error already bound;
    /// `when` / `exceptWhen` are evaluated against it.
    pub fn decide(
        policy: &RetryPolicy,
        state: &RetryState,
        error: &WorkflowError,
        now: DateTime<Utc>,
        evaluator: &dyn ExpressionEvaluator,
        env: &Value,
    ) -> Result<RetryDecision, ExpressionError> {
        if error.is_kind(ErrorKind::Validation) || error.is_kind(ErrorKind::Configuration) {
            return Ok(RetryDecision::Stop(StopReason::NotRetryable));
        }
        if let Some(except_when) = &policy.except_when {
            if evaluator.evaluate_bool(except_when, env)? {
                return Ok(RetryDecision::Stop(StopReason::ExceptWhen));
            }
        }
        if let Some(when) = &policy.when {
            if !evaluator.evaluate_bool(when, env)? {
                return Ok(RetryDecision::Stop(StopReason::WhenFalse));
            }
        }
        if let Some(count) = policy.max_attempts() {
            if state.attempt.saturating_add(1) >= count {
                return Ok(RetryDecision::Stop(StopReason::AttemptsExhausted));
            }
        }

        let delay = Self::delay(policy, state.attempt);
        if let Some(limit) = &policy.limit.duration {
            let elapsed = (now - state.first_attempt_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed.saturating_add(delay) > limit.to_std() {
                return Ok(RetryDecision::Stop(StopReason::DurationExceeded));
            }
        }

        Ok(RetryDecision::Retry {
            attempt: state.attempt + 1,
            delay,
        })
    }
}

/// `base * 2^attempt`, saturating.
pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;
    use serde_json::json;
    use waypost_types::duration::WorkflowDuration;

    fn state(attempt: u32) -> RetryState {
        RetryState {
            attempt,
            first_attempt_at: Utc::now(),
            last_delay_ms: None,
        }
    }

    fn decide(policy: &RetryPolicy, attempt: u32, error: &WorkflowError) -> RetryDecision {
        let env = json!({ "error": serde_json::to_value(error).unwrap() });
        RetryEvaluator::decide(policy, &state(attempt), error, Utc::now(), &JexlEvaluator::new(), &env)
            .unwrap()
    }

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy::new(WorkflowDuration::from_secs(1), BackoffStrategy::Exponential);
        let delays: Vec<u64> = (0..4)
            .map(|i| RetryEvaluator::base_delay(&policy, i).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn linear_and_constant_delays() {
        let linear = RetryPolicy::new(WorkflowDuration::from_millis(100), BackoffStrategy::Linear);
        assert_eq!(RetryEvaluator::base_delay(&linear, 0), Duration::from_millis(100));
        assert_eq!(RetryEvaluator::base_delay(&linear, 2), Duration::from_millis(300));

        let constant = RetryPolicy::new(WorkflowDuration::from_millis(250), BackoffStrategy::Constant);
        assert_eq!(RetryEvaluator::base_delay(&constant, 7), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::new(WorkflowDuration::from_secs(1), BackoffStrategy::Constant)
            .with_jitter(WorkflowDuration::from_millis(10), WorkflowDuration::from_millis(20));
        for _ in 0..50 {
            let d = RetryEvaluator::delay(&policy, 0);
            assert!(d >= Duration::from_millis(1_010) && d <= Duration::from_millis(1_020));
        }
    }

    #[test]
    fn attempt_count_includes_first_attempt() {
        let policy = RetryPolicy::new(WorkflowDuration::from_secs(1), BackoffStrategy::Exponential)
            .with_max_attempts(4);
        let err = WorkflowError::communication("unavailable").with_status(503);
        for attempt in 0..3 {
            assert!(matches!(
                decide(&policy, attempt, &err),
                RetryDecision::Retry { attempt: next, .. } if next == attempt + 1
            ));
        }
        assert_eq!(
            decide(&policy, 3, &err),
            RetryDecision::Stop(StopReason::AttemptsExhausted)
        );
    }

    #[test]
    fn validation_errors_never_retry() {
        let policy = RetryPolicy::new(WorkflowDuration::from_secs(1), BackoffStrategy::Constant);
        let err = WorkflowError::validation("bad input");
        assert_eq!(decide(&policy, 0, &err), RetryDecision::Stop(StopReason::NotRetryable));
    }

    #[test]
    fn except_when_checked_before_when() {
        let mut policy = RetryPolicy::new(WorkflowDuration::from_secs(1), BackoffStrategy::Constant);
        policy.when = Some("error.status > 502".to_string());
        policy.except_when = Some("error.title == 'fatal'".to_string());

        let fatal = WorkflowError::communication("fatal").with_status(503);
        assert_eq!(decide(&policy, 0, &fatal), RetryDecision::Stop(StopReason::ExceptWhen));

        let other = WorkflowError::communication("busy").with_status(500);
        assert_eq!(decide(&policy, 0, &other), RetryDecision::Stop(StopReason::WhenFalse));

        let busy = WorkflowError::communication("busy").with_status(503);
        assert!(matches!(decide(&policy, 0, &busy), RetryDecision::Retry { .. }));
    }

    #[test]
    fn total_duration_limit_stops_retries() {
        let policy = RetryPolicy::new(WorkflowDuration::from_secs(10), BackoffStrategy::Constant)
            .with_max_duration(WorkflowDuration::from_secs(5));
        let err = WorkflowError::timeout("slow");
        assert_eq!(
            decide(&policy, 0, &err),
            RetryDecision::Stop(StopReason::DurationExceeded)
        );
    }

    #[test]
    fn exponential_backoff_saturates() {
        assert_eq!(exponential_backoff(Duration::from_millis(10), 3), Duration::from_millis(80));
        assert!(exponential_backoff(Duration::from_secs(1), 200) > Duration::from_secs(1_000_000));
    }
}
