//! Wait registrations and resume payloads.
//!
//! A `WaitRegistration` is the durable record of one waiting node. It is
//! created in the same commit that suspends the instance and closed in the
//! same commit that enqueues the resume intent, so a wait is never lost and
//! never fires twice.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::{EventEnvelope, ListenSpec};
use crate::error::WorkflowError;
use crate::position::NodePosition;

/// Lifecycle of a registration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Open,
    Fired,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Open => "open",
            RegistrationState::Fired => "fired",
        }
    }
}

/// An event accepted by a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedEvent {
    /// Index of the condition the event satisfied.
    pub condition: usize,
    pub event: EventEnvelope,
}

/// Accumulated correlation progress of an event registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationState {
    /// Accepted events in arrival order.
    #[serde(default)]
    pub matched: Vec<MatchedEvent>,
    /// Expectations learned from the first observed value of each key.
    #[serde(default)]
    pub learned: BTreeMap<String, Value>,
}

impl CorrelationState {
    pub fn is_condition_satisfied(&self, condition: usize) -> bool {
        self.matched.iter().any(|m| m.condition == condition)
    }
}

/// What a registration is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitKind {
    /// A `wait` task.
    Duration { wake_at: DateTime<Utc> },
    /// A scheduled retry of a try body.
    Retry { wake_at: DateTime<Utc>, attempt: u32 },
    /// An activity that reported a pending result.
    Activity { activity: String },
    /// A `listen` task.
    Event {
        listen: ListenSpec,
        /// Expectations resolved at registration time, keyed by correlation key.
        #[serde(default)]
        expectations: BTreeMap<String, Value>,
        #[serde(default)]
        correlation: CorrelationState,
    },
}

impl WaitKind {
    pub fn label(&self) -> &'static str {
        match self {
            WaitKind::Duration { .. } => "duration",
            WaitKind::Retry { .. } => "retry",
            WaitKind::Activity { .. } => "activity",
            WaitKind::Event { .. } => "event",
        }
    }

    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            WaitKind::Duration { wake_at } | WaitKind::Retry { wake_at, .. } => Some(*wake_at),
            WaitKind::Activity { .. } | WaitKind::Event { .. } => None,
        }
    }
}

/// Durable record of one waiting node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitRegistration {
    pub instance_id: Uuid,
    pub position: NodePosition,
    /// Opaque resume token, unique across all registrations.
    pub token: String,
    pub kind: WaitKind,
    /// Node deadline; reaching it fails the node with a timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub state: RegistrationState,
    /// Row version for optimistic correlation updates.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl WaitRegistration {
    pub fn new(
        instance_id: Uuid,
        position: NodePosition,
        token: String,
        kind: WaitKind,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            instance_id,
            position,
            token,
            kind,
            deadline,
            state: RegistrationState::Open,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Earliest instant the scheduler must look at this registration.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match (self.kind.wake_at(), self.deadline) {
            (Some(wake), Some(deadline)) => Some(wake.min(deadline)),
            (wake, deadline) => wake.or(deadline),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == RegistrationState::Open
    }

    /// `true` once the deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Payload handed to a waiting node on resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumePayload {
    /// A duration or retry wait elapsed.
    Timer,
    /// The awaited work produced an output.
    Completed { output: Value },
    /// The awaited work failed.
    Failed { error: WorkflowError },
    /// The node deadline passed before completion.
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registration(kind: WaitKind, deadline: Option<DateTime<Utc>>) -> WaitRegistration {
        WaitRegistration::new(
            Uuid::now_v7(),
            NodePosition::root().child("do", "pause"),
            "tok".to_string(),
            kind,
            deadline,
        )
    }

    #[test]
    fn due_at_is_earliest_of_wake_and_deadline() {
        let now = Utc::now();
        let reg = registration(
            WaitKind::Duration {
                wake_at: now + Duration::seconds(10),
            },
            Some(now + Duration::seconds(5)),
        );
        assert_eq!(reg.due_at(), Some(now + Duration::seconds(5)));
    }

    #[test]
    fn activity_without_deadline_is_never_due() {
        let reg = registration(
            WaitKind::Activity {
                activity: "charge".to_string(),
            },
            None,
        );
        assert_eq!(reg.due_at(), None);
        assert!(!reg.is_expired(Utc::now()));
    }

    #[test]
    fn resume_payload_is_tagged() {
        let json = serde_json::to_value(ResumePayload::Completed {
            output: serde_json::json!({"ok": true}),
        })
        .unwrap();
        assert_eq!(json["kind"], "completed");
        let back: ResumePayload = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ResumePayload::Completed { .. }));
    }
}
