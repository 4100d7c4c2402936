//! SQLite instance repository.
//!
//! Implements `InstanceRepository` from `waypost-core`. Instances, wait
//! registrations and definitions are stored as JSON documents next to the
//! columns the engine queries on. An `InstanceCommit` is applied in one
//! transaction on the writer pool, so the snapshot, its registrations and
//! its outbox records become visible together or not at all.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z`)
//! so that text comparison orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;
use waypost_core::repository::{InstanceCommit, InstanceRepository};
use waypost_types::definition::{DefinitionRef, WorkflowDefinition};
use waypost_types::error::RepositoryError;
use waypost_types::instance::{InstanceStatus, WorkflowInstance};
use waypost_types::outbox::{NewOutboxRecord, OutboxRecord, OutboxStatus};
use waypost_types::wait::{RegistrationState, WaitRegistration};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `InstanceRepository`.
#[derive(Clone)]
pub struct SqliteInstanceRepository {
    pool: DatabasePool,
}

impl SqliteInstanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct OutboxRow {
    id: i64,
    target: String,
    payload: String,
    status: String,
    attempts: i64,
    next_attempt_at: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl OutboxRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            target: row.try_get("target")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<OutboxRecord, RepositoryError> {
        let status = OutboxStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Query(format!("invalid outbox status: {}", self.status)))?;
        Ok(OutboxRecord {
            id: self.id,
            target: from_json(&self.target, "outbox target")?,
            payload: from_json(&self.payload, "outbox payload")?,
            status,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            next_attempt_at: parse_datetime(&self.next_attempt_at)?,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Map a UNIQUE violation to `Conflict`, anything else to `Query`.
fn conflict_on_unique(e: sqlx::Error, conflict: impl FnOnce() -> String) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(conflict());
        }
    }
    query_err(e)
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn registrations_from_rows(rows: &[SqliteRow]) -> Result<Vec<WaitRegistration>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let body: String = row.try_get("body").map_err(query_err)?;
            from_json(&body, "registration")
        })
        .collect()
}

async fn upsert_registration(
    conn: &mut SqliteConnection,
    registration: &WaitRegistration,
) -> Result<(), RepositoryError> {
    let body = to_json(registration, "registration")?;
    sqlx::query(
        r#"INSERT INTO wait_registrations
             (token, instance_id, position, kind, state, due_at, revision, body, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(instance_id, token) DO UPDATE SET
             position = excluded.position,
             kind = excluded.kind,
             state = excluded.state,
             due_at = excluded.due_at,
             revision = excluded.revision,
             body = excluded.body"#,
    )
    .bind(&registration.token)
    .bind(registration.instance_id.to_string())
    .bind(registration.position.to_string())
    .bind(registration.kind.label())
    .bind(registration.state.as_str())
    .bind(registration.due_at().map(|d| format_datetime(&d)))
    .bind(registration.version as i64)
    .bind(&body)
    .bind(format_datetime(&registration.created_at))
    .execute(conn)
    .await
    .map_err(|e| {
        conflict_on_unique(e, || {
            format!(
                "instance {} already waits at {}",
                registration.instance_id, registration.position
            )
        })
    })?;
    Ok(())
}

/// Replace an open registration whose stored revision is `expected_version`.
async fn transition_registration(
    conn: &mut SqliteConnection,
    updated: &WaitRegistration,
    expected_version: u64,
) -> Result<(), RepositoryError> {
    let body = to_json(updated, "registration")?;
    let result = sqlx::query(
        "UPDATE wait_registrations SET state = ?, due_at = ?, revision = ?, body = ?
         WHERE instance_id = ? AND token = ? AND revision = ? AND state = 'open'",
    )
    .bind(updated.state.as_str())
    .bind(updated.due_at().map(|d| format_datetime(&d)))
    .bind(updated.version as i64)
    .bind(&body)
    .bind(updated.instance_id.to_string())
    .bind(&updated.token)
    .bind(expected_version as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;

    if result.rows_affected() == 0 {
        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT revision FROM wait_registrations WHERE instance_id = ? AND token = ?")
                .bind(updated.instance_id.to_string())
                .bind(&updated.token)
                .fetch_optional(&mut *conn)
                .await
                .map_err(query_err)?;
        return Err(match stored {
            Some(_) => RepositoryError::Conflict(format!("registration '{}' moved", updated.token)),
            None => RepositoryError::NotFound,
        });
    }
    Ok(())
}

async fn insert_outbox(
    conn: &mut SqliteConnection,
    record: &NewOutboxRecord,
    now: &str,
) -> Result<i64, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO outbox (target, payload, status, attempts, next_attempt_at, created_at, updated_at)
         VALUES (?, ?, 'pending', 0, ?, ?, ?)",
    )
    .bind(to_json(&record.target, "outbox target")?)
    .bind(to_json(&record.payload, "outbox payload")?)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await
    .map_err(query_err)?;
    Ok(result.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// InstanceRepository impl
// ---------------------------------------------------------------------------

impl InstanceRepository for SqliteInstanceRepository {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let body = to_json(definition, "definition")?;
        let now = format_datetime(&Utc::now());
        let reference = &definition.document;

        let result = sqlx::query(
            r#"INSERT INTO workflow_definitions (namespace, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(namespace, name, version) DO NOTHING"#,
        )
        .bind(&reference.namespace)
        .bind(&reference.name)
        .bind(&reference.version)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Definitions are immutable: an existing reference must carry the same content.
        let (stored,): (String,) = sqlx::query_as(
            "SELECT definition FROM workflow_definitions WHERE namespace = ? AND name = ? AND version = ?",
        )
        .bind(&reference.namespace)
        .bind(&reference.name)
        .bind(&reference.version)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_err)?;
        let stored: serde_json::Value = from_json(&stored, "definition")?;
        let incoming: serde_json::Value = from_json(&body, "definition")?;
        if stored != incoming {
            return Err(RepositoryError::Conflict(format!(
                "definition {reference} already registered with different content"
            )));
        }
        Ok(())
    }

    async fn get_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE namespace = ? AND name = ? AND version = ?",
        )
        .bind(&reference.namespace)
        .bind(&reference.name)
        .bind(&reference.version)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let body: String = row.try_get("definition").map_err(query_err)?;
                Ok(Some(from_json(&body, "definition")?))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, commit: InstanceCommit) -> Result<(), RepositoryError> {
        let instance = &commit.instance;
        let id = instance.id.to_string();
        let snapshot = to_json(instance, "instance")?;
        let deadline = instance.deadline.as_ref().map(format_datetime);
        let now = format_datetime(&Utc::now());

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        match commit.expected_version {
            None => {
                sqlx::query(
                    r#"INSERT INTO workflow_instances
                         (id, namespace, name, version, status, revision, deadline, snapshot, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&id)
                .bind(&instance.definition.namespace)
                .bind(&instance.definition.name)
                .bind(&instance.definition.version)
                .bind(instance.status.as_str())
                .bind(instance.version as i64)
                .bind(&deadline)
                .bind(&snapshot)
                .bind(format_datetime(&instance.created_at))
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(|e| conflict_on_unique(e, || format!("instance {id} already exists")))?;
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE workflow_instances
                     SET status = ?, revision = ?, deadline = ?, snapshot = ?, updated_at = ?
                     WHERE id = ? AND revision = ?",
                )
                .bind(instance.status.as_str())
                .bind(instance.version as i64)
                .bind(&deadline)
                .bind(&snapshot)
                .bind(&now)
                .bind(&id)
                .bind(expected as i64)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;

                if result.rows_affected() == 0 {
                    let stored: Option<(i64,)> =
                        sqlx::query_as("SELECT revision FROM workflow_instances WHERE id = ?")
                            .bind(&id)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(query_err)?;
                    return Err(match stored {
                        Some((stored,)) => RepositoryError::Conflict(format!(
                            "instance {id} at version {stored}, expected {expected}"
                        )),
                        None => RepositoryError::NotFound,
                    });
                }
            }
        }

        for registration in &commit.upsert_registrations {
            let owner: Option<(String,)> = sqlx::query_as(
                "SELECT position FROM wait_registrations WHERE instance_id = ? AND token = ?",
            )
            .bind(registration.instance_id.to_string())
            .bind(&registration.token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;

            if let Some((owner_position,)) = owner {
                let same_node = owner_position == registration.position.to_string();
                if !same_node && !commit.delete_registrations.contains(&registration.token) {
                    return Err(RepositoryError::Conflict(format!(
                        "registration token '{}' already in use",
                        registration.token
                    )));
                }
            }
        }

        if commit.clear_registrations {
            sqlx::query("DELETE FROM wait_registrations WHERE instance_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        for token in &commit.delete_registrations {
            sqlx::query("DELETE FROM wait_registrations WHERE instance_id = ? AND token = ?")
                .bind(&id)
                .bind(token)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        for registration in &commit.upsert_registrations {
            upsert_registration(&mut tx, registration).await?;
        }
        for record in &commit.outbox {
            insert_outbox(&mut tx, record, &now).await?;
        }

        tx.commit().await.map_err(query_err)?;

        tracing::debug!(
            instance_id = %id,
            status = instance.status.as_str(),
            revision = instance.version,
            registrations = commit.upsert_registrations.len(),
            outbox = commit.outbox.len(),
            "instance committed"
        );
        Ok(())
    }

    async fn load_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT snapshot FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let snapshot: String = row.try_get("snapshot").map_err(query_err)?;
                Ok(Some(from_json(&snapshot, "instance")?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT snapshot FROM workflow_instances WHERE status = ? ORDER BY id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT snapshot FROM workflow_instances ORDER BY id")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let snapshot: String = row.try_get("snapshot").map_err(query_err)?;
                from_json(&snapshot, "instance")
            })
            .collect()
    }

    async fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM workflow_instances
             WHERE status IN ('running', 'suspended') AND deadline IS NOT NULL AND deadline <= ?
             ORDER BY id",
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.into_iter()
            .map(|(id,)| {
                id.parse::<Uuid>()
                    .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
            })
            .collect()
    }

    async fn get_registration(
        &self,
        instance_id: &Uuid,
        token: &str,
    ) -> Result<Option<WaitRegistration>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM wait_registrations WHERE instance_id = ? AND token = ?")
            .bind(instance_id.to_string())
            .bind(token)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(registrations_from_rows(&rows)?.into_iter().next())
    }

    async fn list_registrations(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<WaitRegistration>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM wait_registrations WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        let mut registrations = registrations_from_rows(&rows)?;
        registrations.sort_by(|a, b| a.position.cmp(&b.position));
        Ok(registrations)
    }

    async fn due_registrations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WaitRegistration>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM wait_registrations
             WHERE state = 'open' AND due_at IS NOT NULL AND due_at <= ?
             ORDER BY due_at LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        registrations_from_rows(&rows)
    }

    async fn open_event_registrations(&self) -> Result<Vec<WaitRegistration>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM wait_registrations
             WHERE state = 'open' AND kind = 'event'
             ORDER BY created_at",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        registrations_from_rows(&rows)
    }

    async fn update_registration(
        &self,
        registration: &WaitRegistration,
        expected_version: u64,
    ) -> Result<(), RepositoryError> {
        let mut updated = registration.clone();
        updated.version = expected_version + 1;

        let mut conn = self.pool.writer.acquire().await.map_err(query_err)?;
        transition_registration(&mut conn, &updated, expected_version).await
    }

    async fn fire_registration(
        &self,
        registration: &WaitRegistration,
        expected_version: u64,
        record: NewOutboxRecord,
    ) -> Result<(), RepositoryError> {
        let mut fired = registration.clone();
        fired.version = expected_version + 1;
        fired.state = RegistrationState::Fired;
        let now = format_datetime(&Utc::now());

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        transition_registration(&mut tx, &fired, expected_version).await?;
        insert_outbox(&mut tx, &record, &now).await?;
        tx.commit().await.map_err(query_err)?;

        tracing::debug!(
            instance_id = %registration.instance_id,
            position = %registration.position,
            wait = registration.kind.label(),
            "registration fired"
        );
        Ok(())
    }

    async fn enqueue_outbox(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<i64>, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut ids = Vec::with_capacity(records.len());
        for record in &records {
            ids.push(insert_outbox(&mut tx, record, &now).await?);
        }
        tx.commit().await.map_err(query_err)?;
        Ok(ids)
    }

    async fn claim_outbox(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let now_text = format_datetime(&now);
        let stale_before = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let rows = sqlx::query(
            r#"UPDATE outbox
               SET status = 'processing', attempts = attempts + 1, updated_at = ?
               WHERE id IN (
                 SELECT id FROM outbox
                 WHERE (status = 'pending' AND next_attempt_at <= ?)
                    OR (status = 'processing' AND updated_at <= ?)
                 ORDER BY id LIMIT ?
               )
               RETURNING *"#,
        )
        .bind(&now_text)
        .bind(&now_text)
        .bind(format_datetime(&stale_before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_err)?;

        let mut claimed = rows
            .iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map_err(query_err)?
                    .into_record()
            })
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|r| r.id);
        Ok(claimed)
    }

    async fn complete_outbox(&self, id: i64) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn fail_outbox(
        &self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let status = match retry_at {
            Some(_) => OutboxStatus::Pending,
            None => OutboxStatus::Failed,
        };
        let result = sqlx::query(
            "UPDATE outbox
             SET status = ?, last_error = ?, next_attempt_at = COALESCE(?, next_attempt_at), updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(retry_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM outbox WHERE status = ? ORDER BY id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM outbox ORDER BY id")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        rows.iter()
            .map(|row| OutboxRow::from_row(row).map_err(query_err)?.into_record())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypost_core::workflow::Engine;
    use waypost_types::instance::{NodeInstance, NodeStatus};
    use waypost_types::outbox::OutboxTarget;
    use waypost_types::position::NodePosition;
    use waypost_types::wait::{ResumePayload, WaitKind};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    async fn repo() -> SqliteInstanceRepository {
        SqliteInstanceRepository::new(test_pool().await)
    }

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(DefinitionRef::new("shop", "checkout", "1.0.0"), json!({}), json!({}))
    }

    fn timer(instance_id: Uuid, name: &str, wake_at: DateTime<Utc>) -> WaitRegistration {
        WaitRegistration::new(
            instance_id,
            NodePosition::root().child("do", name),
            format!("tok-{instance_id}-{name}"),
            WaitKind::Duration { wake_at },
            None,
        )
    }

    fn definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "document": { "namespace": "shop", "name": "checkout", "version": "1.0.0" },
            "do": [
                { "name": "pause", "type": "wait", "wait": { "seconds": 30 } },
                { "name": "done", "type": "set", "set": { "paid": true } }
            ]
        }))
        .unwrap()
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_save_and_get_definition() {
        let repo = repo().await;
        let def = definition();
        repo.save_definition(&def).await.unwrap();
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.document).await.unwrap().unwrap();
        assert_eq!(loaded.document, def.document);
        assert_eq!(loaded.tasks.len(), 2);

        let mut edited = def.clone();
        edited.description = Some("edited".to_string());
        assert!(matches!(
            repo.save_definition(&edited).await.unwrap_err(),
            RepositoryError::Conflict(_)
        ));
        let stored = repo.get_definition(&def.document).await.unwrap().unwrap();
        assert_eq!(stored.description, None);

        let missing = DefinitionRef::new("shop", "checkout", "2.0.0");
        assert!(repo.get_definition(&missing).await.unwrap().is_none());
    }

    // -- Instances --

    #[tokio::test]
    async fn test_commit_enforces_versions() {
        let repo = repo().await;
        let inst = instance();
        repo.commit(InstanceCommit::create(inst.clone())).await.unwrap();

        let err = repo.commit(InstanceCommit::create(inst.clone())).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let loaded = repo.load_instance(&inst.id).await.unwrap().unwrap();
        repo.commit(InstanceCommit::update(loaded.clone())).await.unwrap();

        let err = repo.commit(InstanceCommit::update(loaded)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.load_instance(&inst.id).await.unwrap().unwrap().version, 1);

        let unknown = InstanceCommit::update(instance());
        assert!(matches!(repo.commit(unknown).await.unwrap_err(), RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_snapshot_preserves_node_map() {
        let repo = repo().await;
        let mut inst = instance();
        let position = NodePosition::root().child("do", "charge");
        let mut node = NodeInstance::new(position.clone());
        node.status = NodeStatus::Completed;
        node.input = Some(json!({ "amount": 12.5, "note": "ünïcødé", "lines": [3, 1, 2] }));
        node.output = Some(json!({ "ok": true }));
        inst.nodes.insert(position.clone(), node);
        repo.commit(InstanceCommit::create(inst.clone())).await.unwrap();

        let loaded = repo.load_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&loaded.nodes[&position].input).unwrap(),
            serde_json::to_string(&inst.nodes[&position].input).unwrap()
        );
        assert_eq!(loaded.nodes[&position].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_and_expire_instances() {
        let repo = repo().await;
        let now = Utc::now();

        let mut overdue = instance();
        overdue.deadline = Some(now - chrono::Duration::seconds(5));
        let mut finished = instance();
        finished.deadline = Some(now - chrono::Duration::seconds(5));
        finished.status = InstanceStatus::Completed;
        let mut later = instance();
        later.deadline = Some(now + chrono::Duration::hours(1));

        for inst in [&overdue, &finished, &later] {
            repo.commit(InstanceCommit::create(inst.clone())).await.unwrap();
        }

        assert_eq!(repo.expired_instances(now).await.unwrap(), vec![overdue.id]);
        let running = repo.list_instances(Some(InstanceStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 2);
        assert_eq!(repo.list_instances(None).await.unwrap().len(), 3);
    }

    // -- Registrations --

    #[tokio::test]
    async fn test_registration_fires_once() {
        let repo = repo().await;
        let inst = instance();
        let reg = timer(inst.id, "pause", Utc::now() - chrono::Duration::seconds(1));
        let mut commit = InstanceCommit::create(inst.clone());
        commit.upsert_registrations.push(reg.clone());
        repo.commit(commit).await.unwrap();

        let due = repo.due_registrations(Utc::now(), 10).await.unwrap();
        assert_eq!(due, vec![reg.clone()]);

        let record = NewOutboxRecord::resume(inst.id, reg.token.clone(), json!({ "kind": "timer" }));
        repo.fire_registration(&reg, 0, record.clone()).await.unwrap();
        let again = repo.fire_registration(&reg, 0, record).await.unwrap_err();
        assert!(matches!(again, RepositoryError::Conflict(_)));

        assert!(repo.due_registrations(Utc::now(), 10).await.unwrap().is_empty());
        let stored = repo.get_registration(&inst.id, &reg.token).await.unwrap().unwrap();
        assert_eq!(stored.state, RegistrationState::Fired);
        assert_eq!(stored.version, 1);

        let outbox = repo.list_outbox(None).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(
            outbox[0].target,
            OutboxTarget::Resume { instance_id: inst.id, token: reg.token.clone() }
        );
        assert!(matches!(
            serde_json::from_value::<ResumePayload>(outbox[0].payload.clone()).unwrap(),
            ResumePayload::Timer
        ));
    }

    #[tokio::test]
    async fn test_tokens_are_scoped_to_their_instance() {
        let repo = repo().await;
        let first = instance();
        let mut reg = timer(first.id, "a", Utc::now());
        reg.token = "approval-1".to_string();
        let mut commit = InstanceCommit::create(first.clone());
        commit.upsert_registrations.push(reg.clone());
        repo.commit(commit).await.unwrap();

        let second = instance();
        let mut shared = timer(second.id, "b", Utc::now());
        shared.token = reg.token.clone();
        let mut commit = InstanceCommit::create(second.clone());
        commit.upsert_registrations.push(shared);
        repo.commit(commit).await.unwrap();

        let record = NewOutboxRecord::resume(first.id, reg.token.clone(), json!({ "kind": "timer" }));
        repo.fire_registration(&reg, 0, record).await.unwrap();
        let other = repo.get_registration(&second.id, "approval-1").await.unwrap().unwrap();
        assert_eq!(other.state, RegistrationState::Open);

        // Inside one instance the token still names a single node.
        let loaded = repo.load_instance(&second.id).await.unwrap().unwrap();
        let mut clash = timer(second.id, "c", Utc::now());
        clash.token = "approval-1".to_string();
        let mut commit = InstanceCommit::update(loaded);
        commit.upsert_registrations.push(clash);
        assert!(matches!(repo.commit(commit).await.unwrap_err(), RepositoryError::Conflict(_)));

        // The failed transaction left the stored revision alone.
        assert_eq!(repo.load_instance(&second.id).await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_update_registration_checks_revision() {
        let repo = repo().await;
        let inst = instance();
        let reg = WaitRegistration::new(
            inst.id,
            NodePosition::root().child("do", "approve"),
            "approval-1".to_string(),
            WaitKind::Activity { activity: "approve".to_string() },
            None,
        );
        let mut commit = InstanceCommit::create(inst);
        commit.upsert_registrations.push(reg.clone());
        repo.commit(commit).await.unwrap();

        repo.update_registration(&reg, 0).await.unwrap();
        assert!(matches!(
            repo.update_registration(&reg, 0).await.unwrap_err(),
            RepositoryError::Conflict(_)
        ));

        let mut unknown = reg.clone();
        unknown.token = "nope".to_string();
        assert!(matches!(
            repo.update_registration(&unknown, 0).await.unwrap_err(),
            RepositoryError::NotFound
        ));
    }

    // -- Outbox --

    #[tokio::test]
    async fn test_outbox_claim_lease_and_failure() {
        let repo = repo().await;
        let ids = repo
            .enqueue_outbox(vec![
                NewOutboxRecord::notify("a", json!(1)),
                NewOutboxRecord::notify("b", json!(2)),
            ])
            .await
            .unwrap();
        assert!(ids[0] < ids[1]);

        let lease = chrono::Duration::seconds(30);
        let now = Utc::now() + chrono::Duration::seconds(1);
        let first = repo.claim_outbox(now, 1, lease).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, ids[0]);
        assert_eq!(first[0].status, OutboxStatus::Processing);
        assert_eq!(first[0].attempts, 1);

        let second = repo.claim_outbox(now, 10, lease).await.unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[1]]);

        // Both leases expire; the stuck records are claimable again.
        let later = now + chrono::Duration::seconds(60);
        let reclaimed = repo.claim_outbox(later, 10, lease).await.unwrap();
        assert_eq!(reclaimed.iter().map(|r| r.attempts).collect::<Vec<_>>(), vec![2, 2]);

        repo.fail_outbox(ids[0], "sink offline", Some(later + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        repo.fail_outbox(ids[1], "gave up", None).await.unwrap();
        repo.complete_outbox(ids[0]).await.unwrap();

        let remaining = repo.list_outbox(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, OutboxStatus::Failed);
        assert_eq!(remaining[0].last_error.as_deref(), Some("gave up"));
        assert!(matches!(
            repo.fail_outbox(ids[0], "gone", None).await.unwrap_err(),
            RepositoryError::NotFound
        ));
    }

    // -- Engine over SQLite --

    #[tokio::test]
    async fn test_engine_suspends_and_resumes_durably() {
        let pool = test_pool().await;
        let engine = Engine::builder(SqliteInstanceRepository::new(pool.clone())).build();
        let reference = engine.register_definition(definition()).await.unwrap();
        let id = engine.start_instance(&reference, json!({ "order": "o-1" })).await.unwrap();

        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Suspended);

        // A fresh engine over the same database picks the instance up.
        let restarted = Engine::builder(SqliteInstanceRepository::new(pool)).build();
        let far = Utc::now() + chrono::Duration::minutes(5);
        let report = restarted.tick(far).await.unwrap();
        assert_eq!(report.timers_fired, 1);
        assert_eq!(report.outbox.delivered, 1);

        let state = restarted.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.output, Some(json!({ "paid": true })));
        assert!(restarted.repository().list_registrations(&id).await.unwrap().is_empty());
    }
}
