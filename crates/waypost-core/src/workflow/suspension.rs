//! Suspension manager.
//!
//! Turns the result of an interpreter pass into a single `InstanceCommit`:
//! the node map, the instance status, registration inserts and deletions and
//! any notify records all land in one transaction. Events are returned
//! separately and published only after the commit succeeds.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use waypost_types::error::WorkflowError;
use waypost_types::event::EngineEvent;
use waypost_types::instance::{InstanceStatus, NodeStatus, WorkflowInstance};
use waypost_types::outbox::NewOutboxRecord;
use waypost_types::position::NodePosition;
use waypost_types::wait::WaitRegistration;

use super::interpreter::{Completion, PassOutput};
use crate::repository::InstanceCommit;

/// Notify topics written to the outbox on terminal transitions.
pub const TOPIC_COMPLETED: &str = "instance.completed";
pub const TOPIC_FAULTED: &str = "instance.faulted";
pub const TOPIC_CANCELLED: &str = "instance.cancelled";

/// Result of `Engine::resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The payload was applied and the instance advanced.
    Resumed,
    /// The token is unknown, already consumed, or its node no longer waits.
    NotWaiting,
    /// No such instance.
    NotFound,
}

/// A commit plus the events to publish once it is durable.
#[derive(Debug)]
pub struct Checkpoint {
    pub commit: InstanceCommit,
    pub events: Vec<EngineEvent>,
}

pub struct SuspensionManager;

impl SuspensionManager {
    /// Build the commit for a finished pass.
    ///
    /// `existing` are the registrations stored for the instance before the
    /// pass; `resolved` are tokens the pass consumed. A stored registration
    /// is deleted when it was resolved, when its node no longer waits, or when
    /// the pass registered a replacement at the same position.
    pub fn checkpoint(
        instance: WorkflowInstance,
        is_new: bool,
        existing: &[WaitRegistration],
        resolved: &[String],
        completion: Completion,
        pass: PassOutput,
    ) -> Checkpoint {
        let mut commit = if is_new {
            InstanceCommit::create(instance)
        } else {
            InstanceCommit::update(instance)
        };
        let mut events = pass.events;
        let instance = &mut commit.instance;
        instance.nodes = pass.nodes;
        instance.context_version += pass.context_changes;
        let id = instance.id;

        match completion {
            Completion::Completed { output, context } => {
                let duration_ms =
                    u64::try_from((Utc::now() - instance.created_at).num_milliseconds()).unwrap_or(0);
                instance.status = InstanceStatus::Completed;
                instance.output = Some(output.clone());
                instance.context = context;
                instance.active_positions.clear();
                commit.clear_registrations = true;
                commit.outbox.push(NewOutboxRecord::notify(
                    TOPIC_COMPLETED,
                    json!({ "instanceId": id, "output": output }),
                ));
                events.push(EngineEvent::InstanceCompleted {
                    instance_id: id,
                    duration_ms,
                });
                tracing::info!(instance_id = %id, duration_ms, "instance completed");
            }
            Completion::Raised(error) => {
                return Self::faulted_commit(commit, events, error);
            }
            Completion::Waiting => {
                let active: Vec<NodePosition> = instance
                    .nodes
                    .values()
                    .filter(|n| n.status.is_waiting())
                    .map(|n| n.position.clone())
                    .collect();
                let replaced: HashSet<&NodePosition> =
                    pass.registrations.iter().map(|r| &r.position).collect();

                commit.delete_registrations = existing
                    .iter()
                    .filter(|r| {
                        resolved.contains(&r.token)
                            || replaced.contains(&r.position)
                            || !instance
                                .nodes
                                .get(&r.position)
                                .is_some_and(|n| n.status.is_waiting())
                    })
                    .map(|r| r.token.clone())
                    .collect();
                commit.upsert_registrations = pass.registrations;

                instance.status = InstanceStatus::Suspended;
                instance.active_positions = active.clone();
                tracing::debug!(
                    instance_id = %id,
                    waiting = active.len(),
                    added = commit.upsert_registrations.len(),
                    removed = commit.delete_registrations.len(),
                    "instance suspended"
                );
                events.push(EngineEvent::InstanceSuspended {
                    instance_id: id,
                    positions: active,
                });
            }
        }

        Checkpoint { commit, events }
    }

    /// Commit faulting an instance outside of a pass (deadline, bad input).
    pub fn faulted(instance: WorkflowInstance, is_new: bool, error: WorkflowError) -> Checkpoint {
        let commit = if is_new {
            InstanceCommit::create(instance)
        } else {
            InstanceCommit::update(instance)
        };
        Self::faulted_commit(commit, Vec::new(), error)
    }

    /// Commit cancelling an instance; every unfinished node is cancelled.
    pub fn cancelled(instance: WorkflowInstance, reason: &str) -> Checkpoint {
        let mut commit = InstanceCommit::update(instance);
        let now = Utc::now();
        let instance = &mut commit.instance;
        for node in instance.nodes.values_mut() {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Cancelled;
                node.resumption = None;
                node.completed_at = Some(now);
            }
        }
        instance.status = InstanceStatus::Cancelled;
        instance.cancel_reason = Some(reason.to_string());
        instance.active_positions.clear();
        commit.clear_registrations = true;
        commit.outbox.push(NewOutboxRecord::notify(
            TOPIC_CANCELLED,
            json!({ "instanceId": instance.id, "reason": reason }),
        ));
        let events = vec![EngineEvent::InstanceCancelled {
            instance_id: instance.id,
            reason: reason.to_string(),
        }];
        Checkpoint { commit, events }
    }

    fn faulted_commit(
        mut commit: InstanceCommit,
        mut events: Vec<EngineEvent>,
        error: WorkflowError,
    ) -> Checkpoint {
        let instance = &mut commit.instance;
        instance.status = InstanceStatus::Faulted;
        instance.last_error = Some(error.clone());
        instance.active_positions.clear();
        commit.clear_registrations = true;
        commit.outbox.push(NewOutboxRecord::notify(
            TOPIC_FAULTED,
            json!({ "instanceId": instance.id, "error": error }),
        ));
        tracing::warn!(instance_id = %instance.id, error = %error, "instance faulted");
        events.push(EngineEvent::InstanceFaulted {
            instance_id: instance.id,
            error,
        });
        Checkpoint { commit, events }
    }
}
