//! Lifecycle events broadcast by the engine.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::DefinitionRef;
use crate::error::WorkflowError;
use crate::position::NodePosition;

/// Events emitted while instances execute.
///
/// Subscribers (loggers, dashboards, tests) receive them on the event bus;
/// durable notifications travel through the outbox instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition: DefinitionRef,
    },

    /// The instance parked on one or more wait registrations.
    InstanceSuspended {
        instance_id: Uuid,
        positions: Vec<NodePosition>,
    },

    InstanceResumed {
        instance_id: Uuid,
        position: NodePosition,
    },

    /// A failed try body will be re-entered after `delay_ms`.
    RetryScheduled {
        instance_id: Uuid,
        position: NodePosition,
        attempt: u32,
        delay_ms: u64,
    },

    /// An inbound event was accepted by a waiting listen node.
    EventCorrelated {
        instance_id: Uuid,
        position: NodePosition,
        event_id: String,
        completed: bool,
    },

    InstanceCompleted {
        instance_id: Uuid,
        duration_ms: u64,
    },

    InstanceFaulted {
        instance_id: Uuid,
        error: WorkflowError,
    },

    InstanceCancelled { instance_id: Uuid, reason: String },

    /// A notify record left the outbox.
    Notification { topic: String, payload: Value },
}

impl EngineEvent {
    /// Instance the event refers to, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::InstanceSuspended { instance_id, .. }
            | EngineEvent::InstanceResumed { instance_id, .. }
            | EngineEvent::RetryScheduled { instance_id, .. }
            | EngineEvent::EventCorrelated { instance_id, .. }
            | EngineEvent::InstanceCompleted { instance_id, .. }
            | EngineEvent::InstanceFaulted { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id, .. } => Some(*instance_id),
            EngineEvent::Notification { .. } => None,
        }
    }
}
