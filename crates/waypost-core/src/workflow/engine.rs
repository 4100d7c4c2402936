//! Engine facade: the public operations over instances.
//!
//! `Engine` owns the ports (repository, activities, expression evaluator,
//! schema validator, notification sink) and the in-process coordination
//! state: one async lock per instance and one cancellation token per running
//! instance. Every state change goes through a single `InstanceCommit`.
//!
//! # Execution flow
//!
//! 1. `start_instance` validates the input, stores the instance as running,
//!    then runs the first pass.
//! 2. A pass replays the node map through the `Interpreter` until the task
//!    tree completes, raises, or every live branch waits.
//! 3. The pass result becomes one commit: node map, wait registrations and
//!    outbox records together.
//! 4. Timers, correlated events and external completions write `resume`
//!    records; the dispatcher delivers them to `resume`, which runs the next
//!    pass under the instance lock.
//! 5. Terminal transitions write `notify` records for the notification sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypost_types::config::EngineConfig;
use waypost_types::correlation::EventEnvelope;
use waypost_types::definition::{DefinitionRef, WorkflowDefinition};
use waypost_types::error::{ConfigurationError, RepositoryError, WorkflowError};
use waypost_types::event::EngineEvent;
use waypost_types::instance::{InstanceState, InstanceStatus, NodeStatus, WorkflowInstance};
use waypost_types::outbox::{OutboxRecord, OutboxTarget};
use waypost_types::wait::{ResumePayload, WaitRegistration};

use crate::event::bus::EventBus;
use crate::repository::{InstanceCommit, InstanceRepository};

use super::activity::{ActivityRegistry, BoxActivityInvoker};
use super::context::Scope;
use super::correlation::CorrelationEngine;
use super::dispatcher::{
    BoxNotificationSink, DeliveryError, DispatchReport, LogNotificationSink, OutboxDispatcher,
    OutboxHandler,
};
use super::expression::{ExpressionEvaluator, JexlEvaluator};
use super::graph::{GraphCache, NodeGraph};
use super::interpreter::{Completion, Interpreter, RunState, after_from};
use super::scheduler::TimerScheduler;
use super::schema::{BasicSchemaValidator, SchemaValidator};
use super::source::EventSource;
use super::suspension::{Checkpoint, ResumeOutcome, SuspensionManager};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("definition not found: {0}")]
    DefinitionNotFound(DefinitionRef),

    #[error("invalid definition: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("definition {0} is already registered with different content")]
    DefinitionConflict(DefinitionRef),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Repository(RepositoryError::Conflict(_)))
    }
}

/// Work done by one `tick`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timers_fired: usize,
    pub instances_expired: usize,
    pub outbox: DispatchReport,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner<R> {
    repo: R,
    config: EngineConfig,
    activities: BoxActivityInvoker,
    evaluator: Arc<dyn ExpressionEvaluator>,
    schema: Arc<dyn SchemaValidator>,
    sink: BoxNotificationSink,
    graphs: GraphCache,
    correlation: CorrelationEngine,
    scheduler: TimerScheduler,
    dispatcher: OutboxDispatcher,
    event_bus: EventBus,
    /// Serializes passes per instance within this process.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Per-instance cancellation tokens for in-flight passes.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

/// Durable workflow engine over an `InstanceRepository`.
///
/// Cheap to clone; clones share all state.
pub struct Engine<R> {
    inner: Arc<EngineInner<R>>,
}

impl<R> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> std::fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("cached_graphs", &self.inner.graphs.len())
            .field("locked_instances", &self.inner.locks.len())
            .finish_non_exhaustive()
    }
}

pub struct EngineBuilder<R> {
    repo: R,
    config: EngineConfig,
    activities: Option<BoxActivityInvoker>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    schema: Option<Arc<dyn SchemaValidator>>,
    sink: Option<BoxNotificationSink>,
}

impl<R: InstanceRepository + 'static> EngineBuilder<R> {
    pub fn activities(mut self, activities: BoxActivityInvoker) -> Self {
        self.activities = Some(activities);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn schema_validator(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn notification_sink(mut self, sink: BoxNotificationSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Engine<R> {
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(JexlEvaluator::new()));
        let config = self.config;
        let inner = EngineInner {
            correlation: CorrelationEngine::new(Arc::clone(&evaluator))
                .with_conflict_retries(config.resume_conflict_retries),
            scheduler: TimerScheduler::new(config.outbox_batch_size),
            dispatcher: OutboxDispatcher::from_config(&config),
            event_bus: EventBus::new(config.event_channel_capacity),
            repo: self.repo,
            activities: self
                .activities
                .unwrap_or_else(|| BoxActivityInvoker::new(ActivityRegistry::new())),
            evaluator,
            schema: self.schema.unwrap_or_else(|| Arc::new(BasicSchemaValidator)),
            sink: self
                .sink
                .unwrap_or_else(|| BoxNotificationSink::new(LogNotificationSink)),
            graphs: GraphCache::new(),
            locks: DashMap::new(),
            cancellation_tokens: DashMap::new(),
            config,
        };
        Engine {
            inner: Arc::new(inner),
        }
    }
}

impl<R: InstanceRepository + 'static> Engine<R> {
    pub fn builder(repo: R) -> EngineBuilder<R> {
        EngineBuilder {
            repo,
            config: EngineConfig::default(),
            activities: None,
            evaluator: None,
            schema: None,
            sink: None,
        }
    }

    pub fn repository(&self) -> &R {
        &self.inner.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events published after each durable commit.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.event_bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition.
    ///
    /// Definitions are immutable: registering identical content again is a
    /// no-op, different content under an existing reference is rejected.
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<DefinitionRef, EngineError> {
        let definition = Arc::new(definition);
        NodeGraph::build(Arc::clone(&definition))?;
        let reference = definition.document.clone();
        match self.inner.repo.save_definition(&definition).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(reason)) => {
                tracing::warn!(definition = %reference, %reason, "definition change rejected");
                return Err(EngineError::DefinitionConflict(reference));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(definition = %reference, "definition registered");
        Ok(reference)
    }

    async fn graph_for(&self, reference: &DefinitionRef) -> Result<Arc<NodeGraph>, EngineError> {
        if let Some(hit) = self.inner.graphs.cached(reference) {
            return Ok(hit?);
        }
        let definition = self
            .inner
            .repo
            .get_definition(reference)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(reference.clone()))?;
        Ok(self.inner.graphs.get_or_build(&Arc::new(definition))?)
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Start an instance and run it until it completes, faults or waits.
    ///
    /// Input rejected by the definition's input schema yields an instance
    /// faulted with a validation error, not an `Err`.
    pub async fn start_instance(
        &self,
        reference: &DefinitionRef,
        input: Value,
    ) -> Result<Uuid, EngineError> {
        let graph = self.graph_for(reference).await?;
        let definition = graph.definition();

        let context = definition.context.clone().unwrap_or_else(|| json!({}));
        let mut instance = WorkflowInstance::new(reference.clone(), input, context);
        let timeout = definition
            .timeout
            .or(self.inner.config.default_workflow_timeout);
        instance.deadline = timeout.map(|t| after_from(instance.created_at, t.to_std()));
        let id = instance.id;

        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let started = EngineEvent::InstanceStarted {
            instance_id: id,
            definition: reference.clone(),
        };
        let rejected = definition
            .input_schema
            .as_ref()
            .and_then(|schema| self.inner.schema.validate(schema, &instance.input).err());

        let result = match rejected {
            Some(reason) => {
                tracing::warn!(instance_id = %id, %reason, "instance input rejected");
                let error = WorkflowError::validation("Workflow input rejected").with_detail(reason);
                self.apply(SuspensionManager::faulted(instance, true, error), vec![started])
                    .await
            }
            None => {
                async {
                    self.inner
                        .repo
                        .commit(InstanceCommit::create(instance.clone()))
                        .await?;
                    self.inner.event_bus.publish(started);
                    tracing::info!(instance_id = %id, definition = %reference, "instance started");
                    self.run_pass(&graph, instance, Vec::new(), Vec::new(), Vec::new())
                        .await?;
                    Ok::<_, EngineError>(())
                }
                .await
            }
        };

        drop(guard);
        self.release_lock(id, lock);
        result.map(|()| id)
    }

    /// Deliver a payload to the node waiting on `token`.
    ///
    /// Idempotent: a consumed or unknown token yields `NotWaiting` and leaves
    /// the instance untouched.
    pub async fn resume(
        &self,
        instance_id: Uuid,
        token: &str,
        payload: ResumePayload,
    ) -> Result<ResumeOutcome, EngineError> {
        let lock = self.lock_for(instance_id);
        let guard = lock.lock().await;

        let mut conflicts = 0;
        let result = loop {
            match self.try_resume(instance_id, token, payload.clone()).await {
                Err(e) if e.is_conflict() && conflicts < self.inner.config.resume_conflict_retries => {
                    conflicts += 1;
                    tracing::debug!(instance_id = %instance_id, token, conflicts, "resume conflicted, reloading");
                }
                other => break other,
            }
        };

        drop(guard);
        self.release_lock(instance_id, lock);
        result
    }

    async fn try_resume(
        &self,
        instance_id: Uuid,
        token: &str,
        payload: ResumePayload,
    ) -> Result<ResumeOutcome, EngineError> {
        let repo = &self.inner.repo;
        let Some(mut instance) = repo.load_instance(&instance_id).await? else {
            return Ok(ResumeOutcome::NotFound);
        };
        if instance.status.is_terminal() {
            return Ok(ResumeOutcome::NotWaiting);
        }
        let Some(registration) = repo.get_registration(&instance_id, token).await? else {
            return Ok(ResumeOutcome::NotWaiting);
        };
        let Some(node) = instance
            .nodes
            .get_mut(&registration.position)
            .filter(|n| n.status.is_waiting())
        else {
            return Ok(ResumeOutcome::NotWaiting);
        };

        node.status = NodeStatus::Running;
        node.resumption = Some(payload);
        instance.status = InstanceStatus::Running;

        let graph = self.graph_for(&instance.definition).await?;
        let existing = repo.list_registrations(&instance_id).await?;
        tracing::info!(
            instance_id = %instance_id,
            position = %registration.position,
            wait = registration.kind.label(),
            "resuming instance"
        );
        let resumed = EngineEvent::InstanceResumed {
            instance_id,
            position: registration.position.clone(),
        };
        self.run_pass(&graph, instance, existing, vec![registration.token], vec![resumed])
            .await?;
        Ok(ResumeOutcome::Resumed)
    }

    /// Cancel an instance. Returns `false` if it had already finished.
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<bool, EngineError> {
        if let Some(token) = self.inner.cancellation_tokens.get(&instance_id) {
            token.cancel();
        }

        let lock = self.lock_for(instance_id);
        let guard = lock.lock().await;

        let mut conflicts = 0;
        let result = loop {
            let attempt = async {
                let instance = self
                    .inner
                    .repo
                    .load_instance(&instance_id)
                    .await?
                    .ok_or(EngineError::InstanceNotFound(instance_id))?;
                if instance.status.is_terminal() {
                    return Ok(false);
                }
                self.apply(SuspensionManager::cancelled(instance, reason), Vec::new())
                    .await?;
                Ok::<_, EngineError>(true)
            };
            match attempt.await {
                Err(e) if e.is_conflict() && conflicts < self.inner.config.resume_conflict_retries => {
                    conflicts += 1;
                }
                other => break other,
            }
        };

        // A cancelled token would stall every later pass, so never keep it.
        self.inner.cancellation_tokens.remove(&instance_id);
        drop(guard);
        self.release_lock(instance_id, lock);
        result
    }

    pub async fn get_instance_state(&self, instance_id: Uuid) -> Result<InstanceState, EngineError> {
        self.inner
            .repo
            .load_instance(&instance_id)
            .await?
            .map(|instance| instance.state())
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Offer an inbound event to every open listen registration.
    ///
    /// Returns how many registrations accepted it.
    pub async fn offer_event(&self, event: &EventEnvelope) -> Result<usize, EngineError> {
        let correlated = self
            .inner
            .correlation
            .offer(&self.inner.repo, event, Utc::now())
            .await?;
        let accepted = correlated.len();
        for e in correlated {
            self.inner.event_bus.publish(e);
        }
        if accepted == 0 {
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "event matched no wait");
        }
        Ok(accepted)
    }

    /// Re-run instances left `running` by a crash. Returns how many were driven.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let running = self
            .inner
            .repo
            .list_instances(Some(InstanceStatus::Running))
            .await?;
        let mut driven = 0;

        for stale in running {
            let id = stale.id;
            let lock = self.lock_for(id);
            let guard = lock.lock().await;
            let result = self.recover_one(id).await;
            drop(guard);
            self.release_lock(id, lock);

            match result {
                Ok(true) => driven += 1,
                Ok(false) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(instance_id = %id, "instance advanced elsewhere during recovery");
                }
                Err(e) => return Err(e),
            }
        }

        if driven > 0 {
            tracing::info!(driven, "recovered running instances");
        }
        Ok(driven)
    }

    async fn recover_one(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let Some(instance) = self.inner.repo.load_instance(&instance_id).await? else {
            return Ok(false);
        };
        if instance.status != InstanceStatus::Running {
            return Ok(false);
        }
        let graph = self.graph_for(&instance.definition).await?;
        let existing = self.inner.repo.list_registrations(&instance_id).await?;
        tracing::info!(instance_id = %instance_id, "recovering instance");
        self.run_pass(&graph, instance, existing, Vec::new(), Vec::new())
            .await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Fire due timers and fault instances past their deadline.
    pub async fn fire_timers(&self, now: DateTime<Utc>) -> Result<(usize, usize), EngineError> {
        let fired = self.inner.scheduler.fire_due(&self.inner.repo, now).await?;
        let expired = self.fault_expired(now).await?;
        Ok((fired, expired))
    }

    /// Deliver one batch of outbox records.
    pub async fn dispatch_outbox(&self, now: DateTime<Utc>) -> Result<DispatchReport, EngineError> {
        let handler = EngineOutboxHandler { engine: self };
        Ok(self
            .inner
            .dispatcher
            .dispatch_batch(&self.inner.repo, &handler, now)
            .await?)
    }

    /// One round of timers, deadlines and outbox delivery at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let (timers_fired, instances_expired) = self.fire_timers(now).await?;
        let outbox = self.dispatch_outbox(now).await?;
        Ok(TickReport {
            timers_fired,
            instances_expired,
            outbox,
        })
    }

    async fn fault_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = self.inner.repo.expired_instances(now).await?;
        let mut faulted = 0;

        for id in expired {
            let lock = self.lock_for(id);
            let guard = lock.lock().await;
            let result = async {
                let Some(instance) = self.inner.repo.load_instance(&id).await? else {
                    return Ok(false);
                };
                let Some(deadline) = instance.deadline.filter(|d| *d <= now) else {
                    return Ok(false);
                };
                if instance.status.is_terminal() {
                    return Ok(false);
                }
                tracing::warn!(instance_id = %id, %deadline, "instance deadline passed");
                let error = WorkflowError::timeout("Workflow timed out")
                    .with_detail(format!("deadline {deadline} passed"));
                self.apply(SuspensionManager::faulted(instance, false, error), Vec::new())
                    .await?;
                Ok::<_, EngineError>(true)
            }
            .await;
            drop(guard);
            self.release_lock(id, lock);

            match result {
                Ok(true) => {
                    self.inner.cancellation_tokens.remove(&id);
                    faulted += 1;
                }
                Ok(false) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!(instance_id = %id, "expired instance advanced concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(faulted)
    }

    /// Spawn the timer, outbox and event intake loops.
    ///
    /// All loops stop when `shutdown` is cancelled; the intake loop also stops
    /// when the source stream ends.
    pub fn spawn_workers<S: EventSource>(
        &self,
        source: &S,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let timer_period = Duration::from_millis(self.inner.config.timer_poll_ms.max(1));
        let outbox_period = Duration::from_millis(self.inner.config.outbox_poll_ms.max(1));

        let engine = self.clone();
        let stop = shutdown.clone();
        let timers = tokio::spawn(async move {
            let mut interval = tokio::time::interval(timer_period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.fire_timers(Utc::now()).await {
                            tracing::warn!(error = %e, "timer pass failed");
                        }
                    }
                }
            }
            tracing::debug!("timer worker stopped");
        });

        let engine = self.clone();
        let stop = shutdown.clone();
        let outbox = tokio::spawn(async move {
            let mut interval = tokio::time::interval(outbox_period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.dispatch_outbox(Utc::now()).await {
                            tracing::warn!(error = %e, "outbox pass failed");
                        }
                    }
                }
            }
            tracing::debug!("outbox worker stopped");
        });

        let engine = self.clone();
        let mut events = source.subscribe(None);
        let intake = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = events.next() => match next {
                        Some(event) => {
                            if let Err(e) = engine.offer_event(&event).await {
                                tracing::warn!(event_id = %event.id, error = %e, "event intake failed");
                            }
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("event intake stopped");
        });

        vec![timers, outbox, intake]
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    /// Run one interpreter pass and commit its result. Caller holds the lock.
    async fn run_pass(
        &self,
        graph: &NodeGraph,
        mut instance: WorkflowInstance,
        existing: Vec<WaitRegistration>,
        resolved: Vec<String>,
        announced: Vec<EngineEvent>,
    ) -> Result<InstanceStatus, EngineError> {
        let id = instance.id;
        let cancel = self.cancellation_token(id);
        let run = RunState::new(id, std::mem::take(&mut instance.nodes));
        let scope = Scope::new(
            id,
            instance.definition.clone(),
            instance.input.clone(),
            instance.context.clone(),
            None,
        )
        .with_cancel(cancel);

        let mut completion = Interpreter::new(
            graph,
            self.inner.evaluator.as_ref(),
            &self.inner.activities,
            &run,
        )
        .retain_node_states(self.inner.config.retain_node_states)
        .run(instance.input.clone(), scope)
        .await;

        if let (Completion::Completed { output, .. }, Some(schema)) =
            (&completion, &graph.definition().output_schema)
        {
            if let Err(reason) = self.inner.schema.validate(schema, output) {
                tracing::warn!(instance_id = %id, %reason, "instance output rejected");
                completion = Completion::Raised(
                    WorkflowError::validation("Workflow output rejected").with_detail(reason),
                );
            }
        }

        let checkpoint = SuspensionManager::checkpoint(
            instance,
            false,
            &existing,
            &resolved,
            completion,
            run.finish(),
        );
        let status = checkpoint.commit.instance.status;
        self.apply(checkpoint, announced).await?;
        if status.is_terminal() {
            self.inner.cancellation_tokens.remove(&id);
        }
        Ok(status)
    }

    /// Commit, then publish `announced` followed by the checkpoint's events.
    async fn apply(
        &self,
        checkpoint: Checkpoint,
        announced: Vec<EngineEvent>,
    ) -> Result<(), EngineError> {
        self.inner.repo.commit(checkpoint.commit).await?;
        for event in announced.into_iter().chain(checkpoint.events) {
            self.inner.event_bus.publish(event);
        }
        Ok(())
    }

    fn cancellation_token(&self, instance_id: Uuid) -> CancellationToken {
        self.inner
            .cancellation_tokens
            .entry(instance_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, instance_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.inner
            .locks
            .remove_if(&instance_id, |_, l| Arc::strong_count(l) == 1);
    }
}

// ---------------------------------------------------------------------------
// Outbox delivery
// ---------------------------------------------------------------------------

struct EngineOutboxHandler<'a, R> {
    engine: &'a Engine<R>,
}

impl<R: InstanceRepository + 'static> OutboxHandler for EngineOutboxHandler<'_, R> {
    async fn deliver(&self, record: &OutboxRecord) -> Result<(), DeliveryError> {
        match &record.target {
            OutboxTarget::Resume { instance_id, token } => {
                let payload: ResumePayload = serde_json::from_value(record.payload.clone())?;
                let outcome = self
                    .engine
                    .resume(*instance_id, token, payload)
                    .await
                    .map_err(|e| DeliveryError::Resume(e.to_string()))?;
                if outcome != ResumeOutcome::Resumed {
                    tracing::debug!(instance_id = %instance_id, token, ?outcome, "stale resume dropped");
                }
                Ok(())
            }
            OutboxTarget::Notify { topic } => {
                self.engine.inner.sink.notify(topic, &record.payload).await?;
                self.engine.inner.event_bus.publish(EngineEvent::Notification {
                    topic: topic.clone(),
                    payload: record.payload.clone(),
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::workflow::activity::ActivityOutcome;
    use std::sync::Mutex as StdMutex;
    use waypost_types::error::ErrorKind;
    use waypost_types::outbox::OutboxStatus;
    use waypost_types::position::NodePosition;

    fn definition(name: &str, extra: Value, tasks: Value) -> WorkflowDefinition {
        let mut doc = json!({
            "document": { "namespace": "test", "name": name, "version": "1.0.0" },
            "do": tasks
        });
        if let (Some(doc), Value::Object(extra)) = (doc.as_object_mut(), extra) {
            doc.extend(extra);
        }
        serde_json::from_value(doc).unwrap()
    }

    async fn engine_with(
        activities: ActivityRegistry,
        definition: WorkflowDefinition,
    ) -> (Engine<InMemoryRepository>, DefinitionRef) {
        let engine = Engine::builder(InMemoryRepository::new())
            .activities(BoxActivityInvoker::new(activities))
            .build();
        let reference = engine.register_definition(definition).await.unwrap();
        (engine, reference)
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::days(365)
    }

    /// Tick until the instance is terminal or `rounds` run out.
    async fn drive(engine: &Engine<InMemoryRepository>, id: Uuid, rounds: usize) -> InstanceState {
        for _ in 0..rounds {
            let state = engine.get_instance_state(id).await.unwrap();
            if state.status.is_terminal() {
                return state;
            }
            engine.tick(far_future()).await.unwrap();
        }
        engine.get_instance_state(id).await.unwrap()
    }

    #[tokio::test]
    async fn external_completion_resumes_once() {
        let def = definition(
            "external",
            json!({}),
            json!([ { "name": "approve", "type": "call", "call": "approval" } ]),
        );
        let activities = ActivityRegistry::new().register("approval", |_req| async {
            ActivityOutcome::Pending {
                token: "approval-1".to_string(),
            }
        });
        let (engine, reference) = engine_with(activities, def).await;
        let id = engine.start_instance(&reference, json!({})).await.unwrap();

        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Suspended);
        assert_eq!(state.current_positions[0].to_string(), "/do/approve");

        let payload = ResumePayload::Completed {
            output: json!({ "approved": true }),
        };
        let first = engine.resume(id, "approval-1", payload.clone()).await.unwrap();
        assert_eq!(first, ResumeOutcome::Resumed);
        let second = engine.resume(id, "approval-1", payload.clone()).await.unwrap();
        assert_eq!(second, ResumeOutcome::NotWaiting);
        assert_eq!(
            engine.resume(Uuid::now_v7(), "approval-1", payload).await.unwrap(),
            ResumeOutcome::NotFound
        );

        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.output, Some(json!({ "approved": true })));
        assert!(engine.repository().list_registrations(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_exactly_the_attempt_limit_then_catches() {
        let def = definition(
            "retrying",
            json!({}),
            json!([
                { "name": "pay", "type": "try",
                  "try": [ { "name": "charge", "type": "call", "call": "charge" } ],
                  "catch": {
                      "errors": { "with": { "status": 503 } },
                      "retry": { "delay": { "seconds": 1 }, "backoff": "exponential",
                                 "limit": { "attempt": { "count": 4 } } },
                      "do": [ { "name": "recover", "type": "set", "set": { "recovered": true } } ]
                  } }
            ]),
        );
        let attempts = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&attempts);
        let activities = ActivityRegistry::new().register("charge", move |req| {
            seen.lock().unwrap().push(req.attempt);
            async { ActivityOutcome::Failed(WorkflowError::communication("gateway down").with_status(503)) }
        });
        let (engine, reference) = engine_with(activities, def).await;
        let mut events = engine.subscribe();

        let id = engine.start_instance(&reference, json!({})).await.unwrap();
        let state = drive(&engine, id, 10).await;

        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.output, Some(json!({ "recovered": true })));
        assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 3]);

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::RetryScheduled { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);
    }

    #[tokio::test]
    async fn listen_deadline_faults_and_refuses_late_events() {
        let def = definition(
            "deadline",
            json!({}),
            json!([
                { "name": "paid", "type": "listen", "listen": {
                    "to": { "one": { "with": { "type": { "exact": "order.paid" } } } },
                    "timeout": { "milliseconds": 1 } } }
            ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let id = engine.start_instance(&reference, json!({})).await.unwrap();

        let state = drive(&engine, id, 3).await;
        assert_eq!(state.status, InstanceStatus::Faulted);
        let error = state.last_error.unwrap();
        assert!(error.is_kind(ErrorKind::Timeout));
        assert_eq!(error.instance.unwrap().to_string(), "/do/paid");

        let late = EventEnvelope::new("late-1", "/shop", "order.paid", json!({}));
        assert_eq!(engine.offer_event(&late).await.unwrap(), 0);
        assert_eq!(engine.get_instance_state(id).await.unwrap().status, InstanceStatus::Faulted);
    }

    #[tokio::test]
    async fn node_input_is_byte_identical_across_suspension() {
        let def = definition(
            "snapshot",
            json!({}),
            json!([
                { "name": "prepare", "type": "set", "set": { "order": "${ input.order }", "note": "ünïcødé ✓" } },
                { "name": "pause", "type": "wait", "wait": { "minutes": 1 } },
                { "name": "echo", "type": "call", "call": "echo" }
            ]),
        );
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let activities = ActivityRegistry::new().register("echo", move |req| {
            sink.lock().unwrap().push(serde_json::to_string(&req.input).unwrap());
            async move { ActivityOutcome::Completed(req.input) }
        });
        let (engine, reference) = engine_with(activities, def).await;
        let input = json!({ "order": { "z": 1.5, "a": [3, 1, 2], "nested": { "k": null } } });
        let id = engine.start_instance(&reference, input).await.unwrap();

        let suspended = engine.repository().load_instance(&id).await.unwrap().unwrap();
        let pause = &suspended.nodes[&"/do/pause".parse::<NodePosition>().unwrap()];
        let before = serde_json::to_string(&pause.input).unwrap();

        // The stored snapshot survives a serialization round trip unchanged.
        let reloaded: WorkflowInstance =
            serde_json::from_str(&serde_json::to_string(&suspended).unwrap()).unwrap();
        assert_eq!(
            serde_json::to_string(&reloaded.nodes[&"/do/pause".parse::<NodePosition>().unwrap()].input).unwrap(),
            before
        );

        let state = drive(&engine, id, 3).await;
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(*received.lock().unwrap(), vec![before]);
    }

    #[tokio::test]
    async fn correlated_event_completes_listen() {
        let def = definition(
            "listening",
            json!({}),
            json!([
                { "name": "paid", "type": "listen", "listen": {
                    "to": { "one": { "with": { "type": { "exact": "order.paid" } },
                                     "correlate": { "order": { "from": "event.data.orderId",
                                                               "expect": { "expr": "input.orderId" } } } } } } }
            ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let id = engine.start_instance(&reference, json!({ "orderId": "o-7" })).await.unwrap();

        let other = EventEnvelope::new("e0", "/shop", "order.paid", json!({ "orderId": "o-8" }));
        assert_eq!(engine.offer_event(&other).await.unwrap(), 0);
        let mine = EventEnvelope::new("e1", "/shop", "order.paid", json!({ "orderId": "o-7" }));
        assert_eq!(engine.offer_event(&mine).await.unwrap(), 1);

        let state = drive(&engine, id, 3).await;
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.output, Some(json!([ { "orderId": "o-7" } ])));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_idempotent() {
        let def = definition(
            "cancelled",
            json!({}),
            json!([ { "name": "pause", "type": "wait", "wait": { "hours": 1 } } ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let id = engine.start_instance(&reference, json!({})).await.unwrap();
        let token = engine.repository().list_registrations(&id).await.unwrap()[0]
            .token
            .clone();

        assert!(engine.cancel(id, "customer request").await.unwrap());
        assert!(!engine.cancel(id, "again").await.unwrap());

        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Cancelled);
        assert!(engine.repository().list_registrations(&id).await.unwrap().is_empty());
        assert_eq!(
            engine.resume(id, &token, ResumePayload::Timer).await.unwrap(),
            ResumeOutcome::NotWaiting
        );
        assert!(matches!(
            engine.cancel(Uuid::now_v7(), "nobody").await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_input_faults_with_validation_error() {
        let def = definition(
            "validated",
            json!({ "inputSchema": { "type": "object", "required": ["orderId"] } }),
            json!([ { "name": "noop", "type": "set", "set": {} } ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let id = engine.start_instance(&reference, json!({})).await.unwrap();

        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Faulted);
        let error = state.last_error.unwrap();
        assert!(error.is_kind(ErrorKind::Validation));
        assert_eq!(error.detail.as_deref(), Some("$: missing required property 'orderId'"));
    }

    #[tokio::test]
    async fn workflow_deadline_faults_waiting_instance() {
        let def = definition(
            "bounded",
            json!({ "timeout": { "seconds": 1 } }),
            json!([ { "name": "pause", "type": "wait", "wait": { "hours": 1 } } ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let id = engine.start_instance(&reference, json!({})).await.unwrap();

        let report = engine.tick(Utc::now() + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(report.instances_expired, 1);
        assert_eq!(report.timers_fired, 0);

        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Faulted);
        assert!(state.last_error.unwrap().is_kind(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn terminal_transition_notifies_sink() {
        let def = definition(
            "notifying",
            json!({}),
            json!([ { "name": "done", "type": "set", "set": { "ok": true } } ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let mut events = engine.subscribe();
        let id = engine.start_instance(&reference, json!({})).await.unwrap();

        let report = engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.outbox.delivered, 1);
        assert!(engine
            .repository()
            .list_outbox(Some(OutboxStatus::Pending))
            .await
            .unwrap()
            .is_empty());

        let mut topics = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Notification { topic, payload } = event {
                assert_eq!(payload["instanceId"], json!(id));
                topics.push(topic);
            }
        }
        assert_eq!(topics, vec!["instance.completed".to_string()]);
    }

    #[tokio::test]
    async fn recover_drives_running_instances() {
        let def = definition(
            "recovering",
            json!({}),
            json!([ { "name": "done", "type": "set", "set": { "ok": true } } ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let stale = WorkflowInstance::new(reference, json!({}), json!({}));
        let id = stale.id;
        engine
            .repository()
            .commit(InstanceCommit::create(stale))
            .await
            .unwrap();

        assert_eq!(engine.recover().await.unwrap(), 1);
        let state = engine.get_instance_state(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(engine.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_definition_is_an_error() {
        let engine = Engine::builder(InMemoryRepository::new()).build();
        let missing = DefinitionRef::new("test", "missing", "1.0.0");
        assert!(matches!(
            engine.start_instance(&missing, json!({})).await,
            Err(EngineError::DefinitionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn instances_may_share_an_invoker_token() {
        let def = definition(
            "shared-token",
            json!({}),
            json!([ { "name": "approve", "type": "call", "call": "approval" } ]),
        );
        let activities = ActivityRegistry::new().register("approval", |_req| async {
            ActivityOutcome::Pending {
                token: "approval-1".to_string(),
            }
        });
        let (engine, reference) = engine_with(activities, def).await;
        let first = engine.start_instance(&reference, json!({ "n": 1 })).await.unwrap();
        let second = engine.start_instance(&reference, json!({ "n": 2 })).await.unwrap();
        for id in [first, second] {
            let state = engine.get_instance_state(id).await.unwrap();
            assert_eq!(state.status, InstanceStatus::Suspended);
        }

        let done = |v: i64| ResumePayload::Completed { output: json!({ "n": v }) };
        assert_eq!(
            engine.resume(first, "approval-1", done(1)).await.unwrap(),
            ResumeOutcome::Resumed
        );
        let untouched = engine.get_instance_state(second).await.unwrap();
        assert_eq!(untouched.status, InstanceStatus::Suspended);

        assert_eq!(
            engine.resume(second, "approval-1", done(2)).await.unwrap(),
            ResumeOutcome::Resumed
        );
        assert_eq!(engine.get_instance_state(first).await.unwrap().output, Some(json!({ "n": 1 })));
        assert_eq!(engine.get_instance_state(second).await.unwrap().output, Some(json!({ "n": 2 })));
    }

    #[tokio::test]
    async fn registered_definitions_cannot_change() {
        let original = definition(
            "frozen",
            json!({}),
            json!([
                { "name": "pause", "type": "wait", "wait": { "minutes": 1 } },
                { "name": "done", "type": "set", "set": { "from": "v1" } }
            ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), original.clone()).await;
        let id = engine.start_instance(&reference, json!({})).await.unwrap();

        assert_eq!(engine.register_definition(original).await.unwrap(), reference);
        let replaced = definition(
            "frozen",
            json!({}),
            json!([ { "name": "other", "type": "set", "set": { "from": "v1-replaced" } } ]),
        );
        assert!(matches!(
            engine.register_definition(replaced).await,
            Err(EngineError::DefinitionConflict(r)) if r == reference
        ));

        let state = drive(&engine, id, 3).await;
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.output, Some(json!({ "from": "v1" })));
    }

    #[tokio::test]
    async fn failed_cancel_still_drops_the_token() {
        let engine = Engine::builder(InMemoryRepository::new()).build();
        let id = Uuid::now_v7();
        let token = engine.cancellation_token(id);

        assert!(matches!(
            engine.cancel(id, "operator").await,
            Err(EngineError::InstanceNotFound(_))
        ));
        assert!(token.is_cancelled());
        assert!(!engine.inner.cancellation_tokens.contains_key(&id));
    }

    #[tokio::test]
    async fn workers_consume_source_and_stop_on_shutdown() {
        use crate::workflow::source::BroadcastEventSource;

        let def = definition(
            "worker",
            json!({}),
            json!([
                { "name": "paid", "type": "listen", "listen": {
                    "to": { "one": { "with": { "type": { "exact": "order.paid" } } } } } }
            ]),
        );
        let (engine, reference) = engine_with(ActivityRegistry::new(), def).await;
        let source = BroadcastEventSource::new(16);
        let shutdown = CancellationToken::new();
        let handles = engine.spawn_workers(&source, shutdown.clone());

        let id = engine.start_instance(&reference, json!({})).await.unwrap();
        source.publish(EventEnvelope::new("e1", "/shop", "order.paid", json!({ "n": 1 })));

        let mut status = InstanceStatus::Suspended;
        for _ in 0..100 {
            status = engine.get_instance_state(id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, InstanceStatus::Completed);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
