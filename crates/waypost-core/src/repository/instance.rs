//! Instance repository trait definition.
//!
//! Persists definitions, instance snapshots, wait registrations and the
//! outbox. Every state change of an instance goes through `commit`, which
//! writes the snapshot, registration changes and outbox records in one
//! transaction guarded by the instance version.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use waypost_types::definition::{DefinitionRef, WorkflowDefinition};
use waypost_types::error::RepositoryError;
use waypost_types::instance::{InstanceStatus, WorkflowInstance};
use waypost_types::outbox::{NewOutboxRecord, OutboxRecord, OutboxStatus};
use waypost_types::wait::WaitRegistration;

/// One atomic state transition of an instance.
#[derive(Debug, Clone)]
pub struct InstanceCommit {
    /// Snapshot to store.
    pub instance: WorkflowInstance,
    /// Version the stored snapshot must have; `None` inserts a new instance.
    pub expected_version: Option<u64>,
    /// Registrations to insert or replace (keyed by token).
    pub upsert_registrations: Vec<WaitRegistration>,
    /// Tokens of registrations to delete; unknown tokens are ignored.
    pub delete_registrations: Vec<String>,
    /// Delete every registration of the instance before applying upserts.
    pub clear_registrations: bool,
    pub outbox: Vec<NewOutboxRecord>,
}

impl InstanceCommit {
    /// Commit inserting a brand-new instance.
    pub fn create(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            expected_version: None,
            upsert_registrations: Vec::new(),
            delete_registrations: Vec::new(),
            clear_registrations: false,
            outbox: Vec::new(),
        }
    }

    /// Commit replacing the snapshot `instance` was loaded from.
    ///
    /// Bumps the snapshot version; the store rejects the commit if another
    /// writer got there first.
    pub fn update(mut instance: WorkflowInstance) -> Self {
        let expected = instance.version;
        instance.version = expected + 1;
        instance.updated_at = Utc::now();
        Self {
            instance,
            expected_version: Some(expected),
            upsert_registrations: Vec::new(),
            delete_registrations: Vec::new(),
            clear_registrations: false,
            outbox: Vec::new(),
        }
    }
}

/// Repository trait for instance persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a definition by `(namespace, name, version)`.
    fn save_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        reference: &DefinitionRef,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Apply a commit atomically.
    ///
    /// Returns `RepositoryError::Conflict` when the stored version differs
    /// from `expected_version`, when inserting an existing id, or when a
    /// registration token is already taken by another node.
    fn commit(
        &self,
        commit: InstanceCommit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Non-terminal instances whose workflow deadline is at or before `now`.
    fn expired_instances(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Wait registrations
    // -----------------------------------------------------------------------

    /// Tokens are unique per instance, not globally.
    fn get_registration(
        &self,
        instance_id: &Uuid,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<WaitRegistration>, RepositoryError>> + Send;

    fn list_registrations(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WaitRegistration>, RepositoryError>> + Send;

    /// Open registrations whose wake-up time or deadline is at or before `now`.
    fn due_registrations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WaitRegistration>, RepositoryError>> + Send;

    /// Open registrations of listen nodes.
    fn open_event_registrations(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WaitRegistration>, RepositoryError>> + Send;

    /// Replace an open registration if its stored version is `expected_version`.
    ///
    /// The stored row gets `expected_version + 1`.
    fn update_registration(
        &self,
        registration: &WaitRegistration,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark an open registration fired and enqueue `record` in one transaction.
    ///
    /// Fails with `Conflict` if the registration is no longer open or its
    /// version moved.
    fn fire_registration(
        &self,
        registration: &WaitRegistration,
        expected_version: u64,
        record: NewOutboxRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    fn enqueue_outbox(
        &self,
        records: Vec<NewOutboxRecord>,
    ) -> impl std::future::Future<Output = Result<Vec<i64>, RepositoryError>> + Send;

    /// Claim up to `limit` deliverable records in id order.
    ///
    /// Deliverable: pending with `next_attempt_at <= now`, or processing
    /// and untouched for longer than `lease`. Claimed records move to
    /// processing with their attempt count incremented.
    fn claim_outbox(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: chrono::Duration,
    ) -> impl std::future::Future<Output = Result<Vec<OutboxRecord>, RepositoryError>> + Send;

    /// Remove a delivered record.
    fn complete_outbox(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record a failed delivery; `retry_at = None` marks the record failed.
    fn fail_outbox(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<OutboxRecord>, RepositoryError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_bumps_version_and_expects_previous() {
        let mut instance = WorkflowInstance::new(
            DefinitionRef::new("ns", "wf", "1.0.0"),
            json!({}),
            json!({}),
        );
        instance.version = 3;
        let commit = InstanceCommit::update(instance);
        assert_eq!(commit.expected_version, Some(3));
        assert_eq!(commit.instance.version, 4);
    }

    #[test]
    fn create_expects_nothing() {
        let instance = WorkflowInstance::new(
            DefinitionRef::new("ns", "wf", "1.0.0"),
            json!({}),
            json!({}),
        );
        let commit = InstanceCommit::create(instance);
        assert_eq!(commit.expected_version, None);
        assert_eq!(commit.instance.version, 0);
    }
}
