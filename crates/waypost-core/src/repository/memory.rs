//! In-process `InstanceRepository`.
//!
//! All tables live behind one async mutex so every trait method is a single
//! atomic step, which gives commits the same all-or-nothing behavior as the
//! SQLite store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use waypost_types::definition::{DefinitionRef, WorkflowDefinition};
use waypost_types::error::RepositoryError;
use waypost_types::instance::{InstanceStatus, WorkflowInstance};
use waypost_types::outbox::{NewOutboxRecord, OutboxRecord, OutboxStatus};
use waypost_types::wait::{RegistrationState, WaitKind, WaitRegistration};

use super::instance::{InstanceCommit, InstanceRepository};

#[derive(Debug, Default)]
struct Tables {
    definitions: HashMap<DefinitionRef, WorkflowDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    /// Keyed by owning instance and token.
    registrations: HashMap<(Uuid, String), WaitRegistration>,
    outbox: BTreeMap<i64, OutboxRecord>,
    next_outbox_id: i64,
}

impl Tables {
    fn push_outbox(&mut self, record: NewOutboxRecord, now: DateTime<Utc>) -> i64 {
        self.next_outbox_id += 1;
        let id = self.next_outbox_id;
        self.outbox.insert(
            id,
            OutboxRecord {
                id,
                target: record.target,
                payload: record.payload,
                status: OutboxStatus::Pending,
                attempts: 0,
                next_attempt_at: now,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }
}

/// Cloneable handle to shared in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Definitions are immutable once stored; compare by serialized content.
fn same_definition(a: &WorkflowDefinition, b: &WorkflowDefinition) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

impl InstanceRepository for InMemoryRepository {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        if let Some(stored) = tables.definitions.get(&definition.document) {
            if !same_definition(stored, definition) {
                return Err(RepositoryError::Conflict(format!(
                    "definition {} already registered with different content",
                    definition.document
                )));
            }
            return Ok(());
        }
        tables
            .definitions
            .insert(definition.document.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.tables.lock().await.definitions.get(reference).cloned())
    }

    async fn commit(&self, commit: InstanceCommit) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let id = commit.instance.id;

        let stored_version = tables.instances.get(&id).map(|i| i.version);
        match (commit.expected_version, stored_version) {
            (None, None) => {}
            (None, Some(_)) => {
                return Err(RepositoryError::Conflict(format!("instance {id} already exists")));
            }
            (Some(_), None) => return Err(RepositoryError::NotFound),
            (Some(expected), Some(stored)) if expected != stored => {
                return Err(RepositoryError::Conflict(format!(
                    "instance {id} at version {stored}, expected {expected}"
                )));
            }
            (Some(_), Some(_)) => {}
        }

        for reg in &commit.upsert_registrations {
            if let Some(existing) = tables.registrations.get(&(id, reg.token.clone())) {
                if existing.position != reg.position && !commit.delete_registrations.contains(&reg.token) {
                    return Err(RepositoryError::Conflict(format!(
                        "registration token '{}' already in use",
                        reg.token
                    )));
                }
            }
        }

        if commit.clear_registrations {
            tables.registrations.retain(|_, r| r.instance_id != id);
        }
        for token in &commit.delete_registrations {
            tables.registrations.remove(&(id, token.clone()));
        }
        for reg in commit.upsert_registrations {
            tables
                .registrations
                .insert((reg.instance_id, reg.token.clone()), reg);
        }
        let now = Utc::now();
        for record in commit.outbox {
            tables.push_outbox(record, now);
        }
        tables.instances.insert(id, commit.instance);
        Ok(())
    }

    async fn load_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.tables.lock().await.instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut out: Vec<WorkflowInstance> = tables
            .instances
            .values()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|i| i.id);
        Ok(out)
    }

    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut out: Vec<Uuid> = tables
            .instances
            .values()
            .filter(|i| !i.status.is_terminal() && i.deadline.is_some_and(|d| d <= now))
            .map(|i| i.id)
            .collect();
        out.sort();
        Ok(out)
    }

    async fn get_registration(
        &self,
        instance_id: &Uuid,
        token: &str,
    ) -> Result<Option<WaitRegistration>, RepositoryError> {
        Ok(self
            .tables
            .lock()
            .await
            .registrations
            .get(&(*instance_id, token.to_string()))
            .cloned())
    }

    async fn list_registrations(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<WaitRegistration>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut out: Vec<WaitRegistration> = tables
            .registrations
            .values()
            .filter(|r| r.instance_id == *instance_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.position.cmp(&b.position));
        Ok(out)
    }

    async fn due_registrations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WaitRegistration>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut out: Vec<WaitRegistration> = tables
            .registrations
            .values()
            .filter(|r| r.is_open() && r.due_at().is_some_and(|d| d <= now))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.due_at());
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn open_event_registrations(&self) -> Result<Vec<WaitRegistration>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut out: Vec<WaitRegistration> = tables
            .registrations
            .values()
            .filter(|r| r.is_open() && matches!(r.kind, WaitKind::Event { .. }))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn update_registration(
        &self,
        registration: &WaitRegistration,
        expected_version: u64,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .registrations
            .get_mut(&(registration.instance_id, registration.token.clone()))
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version || !stored.is_open() {
            return Err(RepositoryError::Conflict(format!(
                "registration '{}' moved",
                registration.token
            )));
        }
        let mut updated = registration.clone();
        updated.version = expected_version + 1;
        *stored = updated;
        Ok(())
    }

    async fn fire_registration(
        &self,
        registration: &WaitRegistration,
        expected_version: u64,
        record: NewOutboxRecord,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .registrations
            .get_mut(&(registration.instance_id, registration.token.clone()))
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version || !stored.is_open() {
            return Err(RepositoryError::Conflict(format!(
                "registration '{}' moved",
                registration.token
            )));
        }
        let mut fired = registration.clone();
        fired.version = expected_version + 1;
        fired.state = RegistrationState::Fired;
        *stored = fired;
        tables.push_outbox(record, Utc::now());
        Ok(())
    }

    async fn enqueue_outbox(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<i64>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        Ok(records
            .into_iter()
            .map(|r| tables.push_outbox(r, now))
            .collect())
    }

    async fn claim_outbox(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let mut tables = self.tables.lock().await;
        let stale_before = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut claimed = Vec::new();
        for record in tables.outbox.values_mut() {
            if claimed.len() >= limit as usize {
                break;
            }
            let deliverable = match record.status {
                OutboxStatus::Pending => record.next_attempt_at <= now,
                OutboxStatus::Processing => record.updated_at <= stale_before,
                OutboxStatus::Done | OutboxStatus::Failed => false,
            };
            if deliverable {
                record.status = OutboxStatus::Processing;
                record.attempts += 1;
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_outbox(&self, id: i64) -> Result<(), RepositoryError> {
        self.tables.lock().await.outbox.remove(&id);
        Ok(())
    }

    async fn fail_outbox(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let record = tables.outbox.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();
        match retry_at {
            Some(at) => {
                record.status = OutboxStatus::Pending;
                record.next_attempt_at = at;
            }
            None => record.status = OutboxStatus::Failed,
        }
        Ok(())
    }

    async fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect())
    }
}
