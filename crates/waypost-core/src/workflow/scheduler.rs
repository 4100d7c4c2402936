//! Timer scheduler.
//!
//! Finds open registrations whose wake-up time or deadline has passed and
//! fires them: the registration is closed and a resume record is enqueued in
//! the same transaction. The actual resume happens when the outbox dispatcher
//! delivers that record, so a crash between the two steps loses nothing.

use chrono::{DateTime, Utc};
use waypost_types::error::RepositoryError;
use waypost_types::outbox::NewOutboxRecord;
use waypost_types::wait::{ResumePayload, WaitRegistration};

use crate::repository::InstanceRepository;

/// Default number of registrations fired per tick.
const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct TimerScheduler {
    batch_size: u32,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl TimerScheduler {
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Fire every registration due at `now`. Returns how many were fired.
    ///
    /// A registration whose deadline passed resumes with `TimedOut`, even if
    /// its wake-up time passed too. Registrations fired concurrently by
    /// another worker are skipped.
    pub async fn fire_due<R: InstanceRepository>(
        &self,
        repo: &R,
        now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let due = repo.due_registrations(now, self.batch_size).await?;
        let mut fired = 0;
        for registration in due {
            let Some(payload) = Self::payload_for(&registration, now) else {
                continue;
            };
            let body = serde_json::to_value(&payload)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let record = NewOutboxRecord::resume(
                registration.instance_id,
                registration.token.clone(),
                body,
            );
            match repo
                .fire_registration(&registration, registration.version, record)
                .await
            {
                Ok(()) => {
                    fired += 1;
                    tracing::debug!(
                        instance_id = %registration.instance_id,
                        position = %registration.position,
                        kind = registration.kind.label(),
                        timed_out = matches!(payload, ResumePayload::TimedOut),
                        "wait registration fired"
                    );
                }
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::debug!(token = %registration.token, %reason, "registration already handled");
                }
                Err(RepositoryError::NotFound) => {
                    tracing::debug!(token = %registration.token, "registration vanished before firing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }

    /// What a due registration resumes with, or `None` if it is not due.
    pub fn payload_for(registration: &WaitRegistration, now: DateTime<Utc>) -> Option<ResumePayload> {
        if !registration.is_open() {
            return None;
        }
        if registration.is_expired(now) {
            return Some(ResumePayload::TimedOut);
        }
        match registration.kind.wake_at() {
            Some(wake_at) if wake_at <= now => Some(ResumePayload::Timer),
            _ => None,
        }
    }
}
