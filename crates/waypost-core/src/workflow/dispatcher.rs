//! Outbox dispatcher and notification sink port.
//!
//! Records written by commits are claimed in batches, handed to an
//! `OutboxHandler`, and removed on success. A failed delivery is rescheduled
//! with exponential backoff until `max_attempts` is reached, then marked
//! failed. Claims carry a lease, so records held by a crashed worker become
//! deliverable again; delivery is therefore at-least-once and handlers must be
//! idempotent (resumes are, through the registration token).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use waypost_types::config::EngineConfig;
use waypost_types::error::RepositoryError;
use waypost_types::outbox::OutboxRecord;

use super::interpreter::after_from;
use super::retry::exponential_backoff;
use crate::repository::InstanceRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("malformed outbox payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("resume failed: {0}")]
    Resume(String),

    #[error("notification failed: {0}")]
    Notify(String),
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Delivers one claimed outbox record.
pub trait OutboxHandler: Send + Sync {
    fn deliver(&self, record: &OutboxRecord) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Outcome counts of one dispatcher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct OutboxDispatcher {
    batch_size: u32,
    max_attempts: u32,
    backoff: Duration,
    lease: chrono::Duration,
}

impl OutboxDispatcher {
    pub fn new(batch_size: u32, max_attempts: u32, backoff: Duration, lease: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_attempts: max_attempts.max(1),
            backoff,
            lease: chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.outbox_batch_size,
            config.outbox_max_attempts,
            Duration::from_millis(config.outbox_backoff_ms),
            Duration::from_millis(config.outbox_lease_ms),
        )
    }

    /// Claim and deliver one batch, in id order.
    pub async fn dispatch_batch<R, H>(
        &self,
        repo: &R,
        handler: &H,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, RepositoryError>
    where
        R: InstanceRepository,
        H: OutboxHandler,
    {
        let claimed = repo.claim_outbox(now, self.batch_size, self.lease).await?;
        let mut report = DispatchReport::default();

        for record in claimed {
            match handler.deliver(&record).await {
                Ok(()) => {
                    repo.complete_outbox(record.id).await?;
                    report.delivered += 1;
                }
                Err(e) if record.attempts < self.max_attempts => {
                    let delay = exponential_backoff(self.backoff, record.attempts.saturating_sub(1));
                    let retry_at = after_from(now, delay);
                    tracing::warn!(
                        record_id = record.id,
                        attempts = record.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbox delivery failed, rescheduling"
                    );
                    repo.fail_outbox(record.id, &e.to_string(), Some(retry_at)).await?;
                    report.rescheduled += 1;
                }
                Err(e) => {
                    tracing::error!(
                        record_id = record.id,
                        attempts = record.attempts,
                        error = %e,
                        "outbox delivery failed permanently"
                    );
                    repo.fail_outbox(record.id, &e.to_string(), None).await?;
                    report.failed += 1;
                }
            }
        }

        if report != DispatchReport::default() {
            tracing::debug!(?report, "outbox batch dispatched");
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Notification sink
// ---------------------------------------------------------------------------

/// Receives `notify` outbox records (completion, fault, cancellation).
pub trait NotificationSink: Send + Sync {
    fn notify(&self, topic: &str, payload: &Value) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Object-safe version of [`NotificationSink`].
pub trait NotificationSinkDyn: Send + Sync {
    fn notify_boxed<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;
}

impl<T: NotificationSink> NotificationSinkDyn for T {
    fn notify_boxed<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>> {
        Box::pin(self.notify(topic, payload))
    }
}

#[derive(Clone)]
pub struct BoxNotificationSink {
    inner: Arc<dyn NotificationSinkDyn>,
}

impl BoxNotificationSink {
    pub fn new<T: NotificationSink + 'static>(sink: T) -> Self {
        Self {
            inner: Arc::new(sink),
        }
    }

    pub async fn notify(&self, topic: &str, payload: &Value) -> Result<(), DeliveryError> {
        self.inner.notify_boxed(topic, payload).await
    }
}

impl std::fmt::Debug for BoxNotificationSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNotificationSink").finish_non_exhaustive()
    }
}

/// Sink that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    async fn notify(&self, topic: &str, payload: &Value) -> Result<(), DeliveryError> {
        tracing::info!(topic, %payload, "workflow notification");
        Ok(())
    }
}
