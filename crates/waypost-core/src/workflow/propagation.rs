//! Error propagation across nested try/catch scopes.
//!
//! A raised `WorkflowError` unwinds from the failing node through its
//! ancestors. At each enclosing try the catch clause is consulted in order:
//! the `errors.with` attribute filter, then `when`, then `exceptWhen`. A match
//! either schedules a retry, runs the catch body, or re-raises; anything else
//! continues to the next enclosing scope. With no scope left the instance
//! faults.

use chrono::{DateTime, Utc};
use serde_json::Value;
use waypost_types::definition::{CatchSpec, ErrorAttributes};
use waypost_types::error::WorkflowError;
use waypost_types::instance::RetryState;
use waypost_types::position::NodePosition;

use super::expression::{ExpressionError, ExpressionEvaluator};
use super::retry::{RetryDecision, RetryEvaluator};

/// Outcome of offering an error to one try scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchDecision {
    /// Re-enter the body as `attempt` after `delay`.
    Retry {
        attempt: u32,
        delay: std::time::Duration,
    },
    /// Run the catch body.
    Catch,
    /// Hand the error to the next enclosing scope.
    Rethrow,
}

pub struct ErrorPropagator;

impl ErrorPropagator {
    /// `true` when every attribute specified by the filter matches.
    ///
    /// `type` accepts a full type URI or a standard kind name
    /// (`communication`); `instance` matches the raising position or any
    /// position below it.
    pub fn matches_filter(filter: &ErrorAttributes, error: &WorkflowError) -> bool {
        if let Some(expected) = &filter.error_type {
            let kind_name = error.kind().map(|k| k.as_str());
            if *expected != error.error_type && Some(expected.as_str()) != kind_name {
                return false;
            }
        }
        if let Some(status) = filter.status {
            if status != error.status {
                return false;
            }
        }
        if let Some(instance) = &filter.instance {
            let Some(raised_at) = &error.instance else {
                return false;
            };
            let within = match instance.parse::<NodePosition>() {
                Ok(scope) => raised_at.is_within(&scope),
                Err(_) => raised_at.to_string() == *instance,
            };
            if !within {
                return false;
            }
        }
        if let Some(title) = &filter.title {
            if *title != error.title {
                return false;
            }
        }
        if let Some(detail) = &filter.detail {
            if error.detail.as_deref() != Some(detail.as_str()) {
                return false;
            }
        }
        true
    }

    /// Filter, then `when`, then `exceptWhen`.
    pub fn catch_matches(
        catch: &CatchSpec,
        error: &WorkflowError,
        evaluator: &dyn ExpressionEvaluator,
        env: &Value,
    ) -> Result<bool, ExpressionError> {
        if let Some(errors) = &catch.errors {
            if !Self::matches_filter(&errors.with, error) {
                return Ok(false);
            }
        }
        if let Some(when) = &catch.when {
            if !evaluator.evaluate_bool(when, env)? {
                return Ok(false);
            }
        }
        if let Some(except_when) = &catch.except_when {
            if evaluator.evaluate_bool(except_when, env)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decide what one try scope does with `error`.
    ///
    /// `env` must have the error bound under the catch's binding name.
    pub fn decide(
        catch: &CatchSpec,
        retry_state: &RetryState,
        error: &WorkflowError,
        now: DateTime<Utc>,
        evaluator: &dyn ExpressionEvaluator,
        env: &Value,
    ) -> Result<CatchDecision, ExpressionError> {
        if !Self::catch_matches(catch, error, evaluator, env)? {
            return Ok(CatchDecision::Rethrow);
        }
        if let Some(policy) = &catch.retry {
            match RetryEvaluator::decide(policy, retry_state, error, now, evaluator, env)? {
                RetryDecision::Retry { attempt, delay } => {
                    return Ok(CatchDecision::Retry { attempt, delay });
                }
                RetryDecision::Stop(reason) => {
                    tracing::debug!(?reason, attempt = retry_state.attempt, "retries stopped");
                }
            }
        }
        if catch.tasks.is_some() {
            Ok(CatchDecision::Catch)
        } else {
            Ok(CatchDecision::Rethrow)
        }
    }

}
