//! Transactional outbox records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where a record is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum OutboxTarget {
    /// Feed the payload to a waiting node of an instance.
    Resume { instance_id: Uuid, token: String },
    /// Hand the payload to the notification sink.
    Notify { topic: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Done => "done",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "done" => Some(OutboxStatus::Done),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A record to be written alongside a state commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub target: OutboxTarget,
    pub payload: Value,
}

impl NewOutboxRecord {
    pub fn resume(instance_id: Uuid, token: impl Into<String>, payload: Value) -> Self {
        Self {
            target: OutboxTarget::Resume {
                instance_id,
                token: token.into(),
            },
            payload,
        }
    }

    pub fn notify(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            target: OutboxTarget::Notify {
                topic: topic.into(),
            },
            payload,
        }
    }
}

/// A persisted outbox record. Ids are assigned monotonically by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub target: OutboxTarget,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
