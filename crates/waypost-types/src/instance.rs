//! Runtime state of workflow instances and their nodes.
//!
//! The node map is the explicit, serializable paused state of an instance:
//! every reached node keeps its status, input/output snapshots and
//! kind-specific locals, keyed by `NodePosition`. Re-entering the task tree
//! after a resume replays from this map instead of re-executing completed
//! work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::DefinitionRef;
use crate::error::WorkflowError;
use crate::position::NodePosition;
use crate::wait::ResumePayload;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Faulted,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Faulted | InstanceStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Faulted => "faulted",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(InstanceStatus::Running),
            "suspended" => Some(InstanceStatus::Suspended),
            "completed" => Some(InstanceStatus::Completed),
            "faulted" => Some(InstanceStatus::Faulted),
            "cancelled" => Some(InstanceStatus::Cancelled),
            _ => None,
        }
    }
}

/// Status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    RetryScheduled,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }

    /// `true` for nodes parked on a wait registration.
    pub fn is_waiting(&self) -> bool {
        matches!(self, NodeStatus::Waiting | NodeStatus::RetryScheduled)
    }
}

// ---------------------------------------------------------------------------
// Node locals
// ---------------------------------------------------------------------------

/// Which part of a try node is currently executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TryPhase {
    #[default]
    Body,
    RetryWait,
    Catch,
}

/// Retry bookkeeping of a try node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Zero-based index of the attempt currently running (or scheduled).
    pub attempt: u32,
    pub first_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delay_ms: Option<u64>,
}

/// Kind-specific state kept on a node between entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeLocals {
    #[default]
    None,
    /// Index of the chosen case; `None` when no case matched.
    Switch { chosen: Option<usize> },
    Loop {
        /// Collection evaluated once at entry.
        items: Vec<Value>,
        /// Index of the iteration currently running.
        index: usize,
        /// Input of the current iteration.
        carry: Value,
        /// Context value after the last completed iteration.
        context: Value,
        #[serde(default)]
        outputs: Vec<Value>,
    },
    Try {
        phase: TryPhase,
        retry: RetryState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkflowError>,
    },
}

// ---------------------------------------------------------------------------
// NodeInstance
// ---------------------------------------------------------------------------

/// Persisted state of one reached node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub position: NodePosition,
    pub status: NodeStatus,
    /// Input after `input.from` was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Context value in effect after the node completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub locals: NodeLocals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    /// Result handed over by a resume, consumed on the next entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumption: Option<ResumePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeInstance {
    pub fn new(position: NodePosition) -> Self {
        Self {
            position,
            status: NodeStatus::Pending,
            input: None,
            output: None,
            context: None,
            locals: NodeLocals::None,
            error: None,
            resumption: None,
            deadline: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// A running (or finished) execution of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub status: InstanceStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Current context value; replaced by `export.as` transforms.
    pub context: Value,
    /// Incremented every time the context value changes.
    pub context_version: u64,
    #[serde(default)]
    pub nodes: BTreeMap<NodePosition, NodeInstance>,
    /// Positions of the nodes the instance is currently parked on.
    #[serde(default)]
    pub active_positions: Vec<NodePosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WorkflowError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Workflow-level deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped by every commit.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(definition: DefinitionRef, input: Value, context: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition,
            status: InstanceStatus::Running,
            input,
            output: None,
            context,
            context_version: 0,
            nodes: BTreeMap::new(),
            active_positions: Vec::new(),
            last_error: None,
            cancel_reason: None,
            deadline: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Query view of the instance.
    pub fn state(&self) -> InstanceState {
        InstanceState {
            id: self.id,
            definition: self.definition.clone(),
            status: self.status,
            current_positions: self.active_positions.clone(),
            last_error: self.last_error.clone(),
            output: self.output.clone(),
            context_version: self.context_version,
        }
    }
}

/// Result of `get_instance_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub status: InstanceStatus,
    pub current_positions: Vec<NodePosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WorkflowError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub context_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instance_status_terminality() {
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Faulted.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert_eq!(InstanceStatus::parse("suspended"), Some(InstanceStatus::Suspended));
    }

    #[test]
    fn node_map_serializes_with_position_keys() {
        let mut instance = WorkflowInstance::new(
            DefinitionRef::new("ns", "wf", "1.0.0"),
            json!({"a": 1}),
            json!({}),
        );
        let pos = NodePosition::root().child("do", "step");
        let mut node = NodeInstance::new(pos.clone());
        node.status = NodeStatus::Waiting;
        node.locals = NodeLocals::Switch { chosen: Some(1) };
        instance.nodes.insert(pos.clone(), node);

        let json = serde_json::to_value(&instance).unwrap();
        assert!(json["nodes"].get("/do/step").is_some());

        let back: WorkflowInstance = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn state_view_copies_query_fields() {
        let mut instance =
            WorkflowInstance::new(DefinitionRef::new("ns", "wf", "1.0.0"), json!(null), json!({}));
        instance.status = InstanceStatus::Suspended;
        instance.active_positions = vec![NodePosition::root().child("do", "wait")];
        let state = instance.state();
        assert_eq!(state.status, InstanceStatus::Suspended);
        assert_eq!(state.current_positions.len(), 1);
    }
}
