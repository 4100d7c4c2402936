//! Engine configuration types.
//!
//! `EngineConfig` represents `waypost.toml`, which tunes background workers,
//! outbox delivery and state retention.

use serde::{Deserialize, Serialize};

use crate::duration::WorkflowDuration;

/// Top-level configuration for a Waypost engine.
///
/// Loaded from `{data_dir}/waypost.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the timer scheduler looks for due registrations.
    #[serde(default = "default_timer_poll_ms")]
    pub timer_poll_ms: u64,

    /// How often the outbox dispatcher claims a batch.
    #[serde(default = "default_outbox_poll_ms")]
    pub outbox_poll_ms: u64,

    /// Maximum records claimed per dispatcher pass.
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: u32,

    /// Delivery attempts before a record is marked failed.
    #[serde(default = "default_outbox_max_attempts")]
    pub outbox_max_attempts: u32,

    /// Base delay of the exponential redelivery backoff.
    #[serde(default = "default_outbox_backoff_ms")]
    pub outbox_backoff_ms: u64,

    /// Records stuck in processing longer than this are reclaimed.
    #[serde(default = "default_outbox_lease_ms")]
    pub outbox_lease_ms: u64,

    /// Reload-and-retry budget when a commit hits a version conflict.
    #[serde(default = "default_resume_conflict_retries")]
    pub resume_conflict_retries: u32,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Keep node state of finished subtrees instead of pruning it.
    #[serde(default)]
    pub retain_node_states: bool,

    /// Applied to definitions that declare no workflow timeout.
    #[serde(default)]
    pub default_workflow_timeout: Option<WorkflowDuration>,
}

fn default_timer_poll_ms() -> u64 {
    500
}

fn default_outbox_poll_ms() -> u64 {
    200
}

fn default_outbox_batch_size() -> u32 {
    32
}

fn default_outbox_max_attempts() -> u32 {
    8
}

fn default_outbox_backoff_ms() -> u64 {
    1_000
}

fn default_outbox_lease_ms() -> u64 {
    30_000
}

fn default_resume_conflict_retries() -> u32 {
    5
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer_poll_ms: default_timer_poll_ms(),
            outbox_poll_ms: default_outbox_poll_ms(),
            outbox_batch_size: default_outbox_batch_size(),
            outbox_max_attempts: default_outbox_max_attempts(),
            outbox_backoff_ms: default_outbox_backoff_ms(),
            outbox_lease_ms: default_outbox_lease_ms(),
            resume_conflict_retries: default_resume_conflict_retries(),
            event_channel_capacity: default_event_channel_capacity(),
            retain_node_states: false,
            default_workflow_timeout: None,
        }
    }
}
