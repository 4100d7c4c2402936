//! Retry policy configuration attached to a catch clause.

use serde::{Deserialize, Serialize};

use crate::duration::WorkflowDuration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Constant,
    Linear,
    Exponential,
}

/// Uniform random jitter added to every computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jitter {
    pub from: WorkflowDuration,
    pub to: WorkflowDuration,
}

/// Per-attempt limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLimit {
    /// Total number of attempts, the first one included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptLimit>,
    /// Wall-clock budget measured from the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<WorkflowDuration>,
}

/// Retry policy of a try task.
///
/// ```json
/// { "delay": { "seconds": 1 }, "backoff": "exponential",
///   "limit": { "attempt": { "count": 4 } } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Base delay.
    pub delay: WorkflowDuration,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Jitter>,
    #[serde(default)]
    pub limit: RetryLimit,
    /// Retry only while this holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Never retry when this holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
}

impl RetryPolicy {
    pub fn new(delay: WorkflowDuration, backoff: BackoffStrategy) -> Self {
        Self {
            delay,
            backoff,
            jitter: None,
            limit: RetryLimit::default(),
            when: None,
            except_when: None,
        }
    }

    pub fn with_max_attempts(mut self, count: u32) -> Self {
        self.limit.attempt = Some(AttemptLimit { count: Some(count) });
        self
    }

    pub fn with_max_duration(mut self, duration: WorkflowDuration) -> Self {
        self.limit.duration = Some(duration);
        self
    }

    pub fn with_jitter(mut self, from: WorkflowDuration, to: WorkflowDuration) -> Self {
        self.jitter = Some(Jitter { from, to });
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.limit.attempt.as_ref().and_then(|a| a.count)
    }
}
