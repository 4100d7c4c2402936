//! Interpreter: one pass over a definition's task tree.
//!
//! A pass walks the tree depth-first from the root sequence. Every node is
//! entered through `enter`, which either replays a finished node from the
//! node map or runs it and records the result. Each kind resolves to a
//! `Completion`:
//!
//! - `Completed` with the node output and the context value after it
//! - `Waiting` when the node (or something below it) parked on a wait
//!   registration
//! - `Raised` with the `WorkflowError` unwinding towards the nearest try
//!
//! Nothing here touches storage. The pass collects node state, new wait
//! registrations and lifecycle events in a `RunState`; the engine turns them
//! into one `InstanceCommit`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypost_types::correlation::{Expectation, ListenSpec};
use waypost_types::definition::{CatchSpec, ErrorTemplate, ForSpec, SwitchCase, Task, TaskKind};
use waypost_types::duration::WorkflowDuration;
use waypost_types::error::{WorkflowError, ERROR_TYPE_BASE};
use waypost_types::event::EngineEvent;
use waypost_types::instance::{NodeInstance, NodeLocals, NodeStatus, RetryState, TryPhase};
use waypost_types::position::NodePosition;
use waypost_types::wait::{CorrelationState, ResumePayload, WaitKind, WaitRegistration};

use super::activity::{ActivityOutcome, ActivityRequest, BoxActivityInvoker};
use super::context::{check_context_size, extend_env, Scope};
use super::expression::{
    is_runtime_expression, resolve_templates, strip_runtime_expression, ExpressionError,
    ExpressionEvaluator,
};
use super::graph::NodeGraph;
use super::propagation::{CatchDecision, ErrorPropagator};

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Result of entering a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Completed { output: Value, context: Value },
    Waiting,
    Raised(WorkflowError),
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Mutable state of one interpreter pass.
///
/// Shared by concurrently polled fork branches; no map guard is ever held
/// across an await point.
#[derive(Debug)]
pub struct RunState {
    instance_id: Uuid,
    nodes: DashMap<NodePosition, NodeInstance>,
    registrations: DashMap<String, WaitRegistration>,
    events: Mutex<Vec<EngineEvent>>,
    context_changes: AtomicU64,
}

/// Everything a pass produced, ready to be committed.
#[derive(Debug)]
pub struct PassOutput {
    pub nodes: BTreeMap<NodePosition, NodeInstance>,
    /// Registrations created during the pass, ordered by position.
    pub registrations: Vec<WaitRegistration>,
    pub events: Vec<EngineEvent>,
    /// Number of `export.as` transforms applied.
    pub context_changes: u64,
}

impl RunState {
    pub fn new(instance_id: Uuid, nodes: BTreeMap<NodePosition, NodeInstance>) -> Self {
        Self {
            instance_id,
            nodes: nodes.into_iter().collect(),
            registrations: DashMap::new(),
            events: Mutex::new(Vec::new()),
            context_changes: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn node(&self, position: &NodePosition) -> Option<NodeInstance> {
        self.nodes.get(position).map(|n| n.value().clone())
    }

    pub fn finish(self) -> PassOutput {
        let mut registrations: Vec<WaitRegistration> =
            self.registrations.into_iter().map(|(_, r)| r).collect();
        registrations.sort_by(|a, b| a.position.cmp(&b.position));
        PassOutput {
            nodes: self.nodes.into_iter().collect(),
            registrations,
            events: self
                .events
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            context_changes: self.context_changes.into_inner(),
        }
    }

    fn update(&self, position: &NodePosition, f: impl FnOnce(&mut NodeInstance)) {
        let mut entry = self
            .nodes
            .entry(position.clone())
            .or_insert_with(|| NodeInstance::new(position.clone()));
        f(entry.value_mut());
    }

    fn take_resumption(&self, position: &NodePosition) -> Option<ResumePayload> {
        self.nodes
            .get_mut(position)
            .and_then(|mut node| node.resumption.take())
    }

    /// Forget the state of every node in `positions`.
    fn forget(&self, positions: &HashSet<&NodePosition>) {
        if positions.is_empty() {
            return;
        }
        self.nodes.retain(|p, _| !positions.contains(p));
        self.registrations
            .retain(|_, r| !positions.contains(&r.position));
    }

    /// Mark every node in `positions` cancelled and drop their new waits.
    fn cancel(&self, positions: &HashSet<&NodePosition>) {
        let now = Utc::now();
        for mut node in self.nodes.iter_mut() {
            if positions.contains(node.key()) && !node.status.is_terminal() {
                node.status = NodeStatus::Cancelled;
                node.resumption = None;
                node.completed_at = Some(now);
            }
        }
        self.registrations
            .retain(|_, r| !positions.contains(&r.position));
    }

    fn register(&self, registration: WaitRegistration) {
        self.registrations
            .insert(registration.token.clone(), registration);
    }

    fn emit(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// How a leaf finds itself on entry.
enum LeafState {
    Fresh,
    /// Waiting on a registration that has not fired.
    Parked,
    Resumed(ResumePayload),
}

pub struct Interpreter<'a> {
    graph: &'a NodeGraph,
    evaluator: &'a dyn ExpressionEvaluator,
    activities: &'a BoxActivityInvoker,
    run: &'a RunState,
    retain_node_states: bool,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        graph: &'a NodeGraph,
        evaluator: &'a dyn ExpressionEvaluator,
        activities: &'a BoxActivityInvoker,
        run: &'a RunState,
    ) -> Self {
        Self {
            graph,
            evaluator,
            activities,
            run,
            retain_node_states: false,
        }
    }

    /// Keep node state below finished composites instead of pruning it.
    pub fn retain_node_states(mut self, retain: bool) -> Self {
        self.retain_node_states = retain;
        self
    }

    /// Forget every node strictly below `position`.
    fn clear_below(&self, position: &NodePosition) {
        let below: HashSet<&NodePosition> = self.graph.descendants(position).into_iter().collect();
        self.run.forget(&below);
    }

    /// Cancel `position` and its subtree.
    fn cancel_within(&self, position: &NodePosition) {
        let mut within: HashSet<&NodePosition> =
            self.graph.descendants(position).into_iter().collect();
        within.insert(position);
        self.run.cancel(&within);
    }

    /// Run the root sequence with the workflow input.
    pub async fn run(&self, input: Value, scope: Scope) -> Completion {
        let tasks = &self.graph.definition().tasks;
        self.sequence(tasks, &NodePosition::root(), "do", input, scope)
            .await
    }

    // -----------------------------------------------------------------------
    // Node entry
    // -----------------------------------------------------------------------

    fn enter<'s>(
        &'s self,
        task: &'s Task,
        position: NodePosition,
        input: Value,
        scope: Scope,
    ) -> BoxFuture<'s, Completion> {
        Box::pin(async move {
            if scope.cancel.is_cancelled() {
                return Completion::Waiting;
            }

            let (input, deadline) = match self.run.node(&position) {
                Some(node) => match node.status {
                    NodeStatus::Completed => {
                        return Completion::Completed {
                            output: node.output.unwrap_or(Value::Null),
                            context: node.context.unwrap_or(scope.context),
                        };
                    }
                    NodeStatus::Failed | NodeStatus::Cancelled => {
                        return Completion::Raised(node.error.unwrap_or_else(|| {
                            WorkflowError::runtime("Task cancelled").at(&position)
                        }));
                    }
                    _ => (node.input.unwrap_or(input), node.deadline),
                },
                None => match self.prepare(task, &position, input, &scope) {
                    Ok(Some(prepared)) => prepared,
                    Ok(None) => return self.skip(&position, &scope),
                    Err(err) => return self.settle(task, &position, &Value::Null, &scope, Completion::Raised(err)),
                },
            };

            let scope = scope.with_deadline(deadline);
            let completion = self.execute(task, &position, input.clone(), &scope).await;
            self.settle(task, &position, &input, &scope, completion)
        })
    }

    /// First entry: evaluate the guard, shape the input, fix the node deadline.
    ///
    /// Returns `None` when the guard is false.
    fn prepare(
        &self,
        task: &Task,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Result<Option<(Value, Option<DateTime<Utc>>)>, WorkflowError> {
        let env = scope.env(position, &input);
        if let Some(guard) = &task.guard {
            let pass = self
                .evaluator
                .evaluate_bool(guard, &env)
                .map_err(|e| expression_error(e, position))?;
            if !pass {
                self.run.update(position, |n| n.input = Some(input.clone()));
                return Ok(None);
            }
        }

        let input = match &task.input_from {
            Some(expr) => self
                .evaluator
                .evaluate(expr, &env)
                .map_err(|e| expression_error(e, position))?,
            None => input,
        };
        let deadline = task.timeout.map(|t| after(t.to_std()));

        tracing::debug!(
            instance_id = %self.run.instance_id,
            position = %position,
            kind = task.kind.label(),
            "entering task"
        );
        self.run.update(position, |n| {
            n.status = NodeStatus::Running;
            n.input = Some(input.clone());
            n.deadline = deadline;
            n.started_at = Utc::now();
        });
        Ok(Some((input, deadline)))
    }

    fn skip(&self, position: &NodePosition, scope: &Scope) -> Completion {
        let now = Utc::now();
        let mut output = Value::Null;
        self.run.update(position, |n| {
            output = n.input.clone().unwrap_or(Value::Null);
            n.status = NodeStatus::Completed;
            n.output = Some(output.clone());
            n.context = Some(scope.context.clone());
            n.completed_at = Some(now);
        });
        tracing::debug!(instance_id = %self.run.instance_id, position = %position, "guard false, task skipped");
        Completion::Completed {
            output,
            context: scope.context.clone(),
        }
    }

    /// Record the completion of a node and apply its output transforms.
    fn settle(
        &self,
        task: &Task,
        position: &NodePosition,
        input: &Value,
        scope: &Scope,
        completion: Completion,
    ) -> Completion {
        match completion {
            Completion::Completed { output, context } => {
                match self.transform_output(task, position, input, output, context, scope) {
                    Ok((output, context)) => {
                        let now = Utc::now();
                        let retain = self.retain_node_states;
                        self.run.update(position, |n| {
                            n.status = NodeStatus::Completed;
                            n.output = Some(output.clone());
                            n.context = Some(context.clone());
                            n.error = None;
                            n.completed_at = Some(now);
                            if !retain {
                                n.locals = NodeLocals::None;
                            }
                        });
                        if !retain {
                            self.clear_below(position);
                        }
                        Completion::Completed { output, context }
                    }
                    Err(err) => self.settle(task, position, input, scope, Completion::Raised(err)),
                }
            }
            Completion::Waiting => Completion::Waiting,
            Completion::Raised(err) => {
                let err = err.at(position);
                let now = Utc::now();
                self.run.update(position, |n| {
                    n.status = NodeStatus::Failed;
                    n.error = Some(err.clone());
                    n.completed_at = Some(now);
                });
                tracing::debug!(
                    instance_id = %self.run.instance_id,
                    position = %position,
                    error = %err,
                    "task raised"
                );
                Completion::Raised(err)
            }
        }
    }

    /// Apply `output.as` and `export.as`.
    fn transform_output(
        &self,
        task: &Task,
        position: &NodePosition,
        input: &Value,
        output: Value,
        context: Value,
        scope: &Scope,
    ) -> Result<(Value, Value), WorkflowError> {
        let mut output = output;
        let mut context = context;
        if let Some(expr) = &task.output_as {
            let env = extend_env(
                scope.with_context(context.clone()).env(position, input),
                "output",
                output.clone(),
            );
            output = self
                .evaluator
                .evaluate(expr, &env)
                .map_err(|e| expression_error(e, position))?;
        }
        if let Some(expr) = &task.export_as {
            let env = extend_env(
                scope.with_context(context.clone()).env(position, input),
                "output",
                output.clone(),
            );
            let exported = self
                .evaluator
                .evaluate(expr, &env)
                .map_err(|e| expression_error(e, position))?;
            check_context_size(&exported).map_err(|e| e.at(position))?;
            self.run.context_changes.fetch_add(1, Ordering::Relaxed);
            context = exported;
        }
        Ok((output, context))
    }

    async fn execute(
        &self,
        task: &Task,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        match &task.kind {
            TaskKind::Do { tasks } => {
                self.sequence(tasks, position, "do", input, scope.clone())
                    .await
            }
            TaskKind::Switch { cases } => self.switch(cases, position, input, scope).await,
            TaskKind::For(spec) => self.for_each(spec, position, input, scope).await,
            TaskKind::Fork { branches, compete } => {
                self.fork(branches, *compete, position, input, scope).await
            }
            TaskKind::Try { body, catch } => {
                self.try_catch(body, catch, position, input, scope).await
            }
            TaskKind::Set { set } => self.set(set, position, &input, scope),
            TaskKind::Raise { error } => {
                Completion::Raised(self.raise(error, position, &input, scope))
            }
            TaskKind::Call { call, with } => self.call(call, with, position, input, scope).await,
            TaskKind::Wait { wait } => self.wait(*wait, position, input, scope),
            TaskKind::Listen { listen } => self.listen(listen, position, input, scope),
        }
    }

    // -----------------------------------------------------------------------
    // Composites
    // -----------------------------------------------------------------------

    /// Children in order; each output is the next input.
    async fn sequence(
        &self,
        tasks: &[Task],
        parent: &NodePosition,
        role: &str,
        input: Value,
        scope: Scope,
    ) -> Completion {
        let mut current = input;
        let mut scope = scope;
        for task in tasks {
            let position = parent.child(role, &task.name);
            match self.enter(task, position, current, scope.clone()).await {
                Completion::Completed { output, context } => {
                    current = output;
                    scope = scope.with_context(context);
                }
                other => return other,
            }
        }
        Completion::Completed {
            output: current,
            context: scope.context,
        }
    }

    async fn switch(
        &self,
        cases: &[SwitchCase],
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        let chosen = match self.run.node(position).map(|n| n.locals) {
            Some(NodeLocals::Switch { chosen }) => chosen,
            _ => {
                let env = scope.env(position, &input);
                let mut matched = None;
                let mut default = None;
                for (i, case) in cases.iter().enumerate() {
                    match &case.when {
                        None => {
                            default.get_or_insert(i);
                        }
                        Some(when) => match self.evaluator.evaluate_bool(when, &env) {
                            Ok(true) => {
                                matched = Some(i);
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => return Completion::Raised(expression_error(e, position)),
                        },
                    }
                }
                let chosen = matched.or(default);
                self.run
                    .update(position, |n| n.locals = NodeLocals::Switch { chosen });
                chosen
            }
        };

        match chosen.and_then(|i| cases.get(i)) {
            Some(case) => {
                tracing::debug!(instance_id = %self.run.instance_id, position = %position, case = %case.name, "switch case chosen");
                let case_position = position.child("switch", &case.name);
                self.sequence(&case.tasks, &case_position, "do", input, scope.clone())
                    .await
            }
            None => Completion::Completed {
                output: input,
                context: scope.context.clone(),
            },
        }
    }

    async fn for_each(
        &self,
        spec: &ForSpec,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        let (items, mut index, mut carry, mut context, mut outputs, mut resuming) =
            match self.run.node(position).map(|n| n.locals) {
                Some(NodeLocals::Loop {
                    items,
                    index,
                    carry,
                    context,
                    outputs,
                }) => (items, index, carry, context, outputs, true),
                _ => {
                    let env = scope.env(position, &input);
                    let items = match self.evaluator.evaluate(&spec.collection, &env) {
                        Ok(Value::Array(items)) => items,
                        Ok(Value::Null) => Vec::new(),
                        Ok(Value::Object(map)) => map.into_iter().map(|(_, v)| v).collect(),
                        Ok(other) => {
                            return Completion::Raised(
                                WorkflowError::expression("Loop collection is not iterable")
                                    .with_detail(format!(
                                        "'{}' evaluated to {other}",
                                        spec.collection
                                    ))
                                    .at(position),
                            );
                        }
                        Err(e) => return Completion::Raised(expression_error(e, position)),
                    };
                    (items, 0, input, scope.context.clone(), Vec::new(), false)
                }
            };

        while index < items.len() {
            let iteration = scope
                .with_context(context.clone())
                .with_binding(&spec.each, items[index].clone())
                .with_binding(&spec.at, Value::from(index));

            // An iteration interrupted by a suspension already passed its guard.
            if !resuming {
                if let Some(guard) = &spec.while_ {
                    match self
                        .evaluator
                        .evaluate_bool(guard, &iteration.env(position, &carry))
                    {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => return Completion::Raised(expression_error(e, position)),
                    }
                }
                let locals = NodeLocals::Loop {
                    items: items.clone(),
                    index,
                    carry: carry.clone(),
                    context: context.clone(),
                    outputs: outputs.clone(),
                };
                self.run.update(position, |n| n.locals = locals);
            }
            resuming = false;

            match self
                .sequence(&spec.tasks, position, "for", carry.clone(), iteration)
                .await
            {
                Completion::Completed { output, context: next } => {
                    if spec.collect {
                        outputs.push(output.clone());
                    }
                    carry = output;
                    context = next;
                    index += 1;
                    self.clear_below(position);
                }
                other => return other,
            }
        }

        let output = if spec.collect {
            Value::Array(outputs)
        } else {
            carry
        };
        Completion::Completed { output, context }
    }

    /// Run branches concurrently against the same input.
    ///
    /// Wait-all joins outputs in declaration order and fails on the first
    /// error; a race (`compete`) takes the first completed branch and fails
    /// only when every branch failed. Losing branches are cancelled.
    async fn fork(
        &self,
        branches: &[Task],
        compete: bool,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        let tokens: Vec<CancellationToken> =
            branches.iter().map(|_| scope.cancel.child_token()).collect();

        let mut pending: FuturesUnordered<BoxFuture<'_, (usize, Completion)>> =
            FuturesUnordered::new();
        for (i, branch) in branches.iter().enumerate() {
            let branch_position = position.child("fork", &branch.name);
            // Each branch sees its own copy of the context.
            let branch_scope = scope.with_cancel(tokens[i].clone());
            let input = input.clone();
            pending.push(Box::pin(async move {
                (i, self.enter(branch, branch_position, input, branch_scope).await)
            }));
        }

        let mut results: Vec<Option<Completion>> = vec![None; branches.len()];
        loop {
            let next = pending.next().await;
            let Some((i, completion)) = next else {
                break;
            };
            match completion {
                Completion::Completed { output, context } if compete => {
                    drop(pending);
                    self.abandon(branches, position, &tokens, i);
                    tracing::debug!(
                        instance_id = %self.run.instance_id,
                        position = %position,
                        winner = %branches[i].name,
                        "race decided"
                    );
                    return Completion::Completed { output, context };
                }
                Completion::Raised(err) if !compete => {
                    drop(pending);
                    self.abandon(branches, position, &tokens, i);
                    return Completion::Raised(err);
                }
                other => results[i] = Some(other),
            }
        }

        if results
            .iter()
            .any(|r| matches!(r, Some(Completion::Waiting)))
        {
            return Completion::Waiting;
        }

        if compete {
            let first_error = results.into_iter().flatten().find_map(|r| match r {
                Completion::Raised(err) => Some(err),
                _ => None,
            });
            return Completion::Raised(first_error.unwrap_or_else(|| {
                WorkflowError::runtime("Race without branches").at(position)
            }));
        }

        let mut outputs = Vec::with_capacity(branches.len());
        let mut contexts = Vec::with_capacity(branches.len());
        for result in results.into_iter().flatten() {
            if let Completion::Completed { output, context } = result {
                outputs.push(output);
                contexts.push(context);
            }
        }
        Completion::Completed {
            output: Value::Array(outputs),
            context: merge_contexts(&scope.context, contexts),
        }
    }

    /// Cancel every branch except `keep`.
    fn abandon(
        &self,
        branches: &[Task],
        position: &NodePosition,
        tokens: &[CancellationToken],
        keep: usize,
    ) {
        for (i, branch) in branches.iter().enumerate() {
            if i == keep {
                continue;
            }
            tokens[i].cancel();
            self.cancel_within(&position.child("fork", &branch.name));
        }
    }

    async fn try_catch(
        &self,
        body: &[Task],
        catch: &CatchSpec,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        let (mut phase, retry, mut caught) = match self.run.node(position).map(|n| n.locals) {
            Some(NodeLocals::Try {
                phase,
                retry,
                error,
            }) => (phase, retry, error),
            _ => {
                let retry = RetryState {
                    attempt: 0,
                    first_attempt_at: Utc::now(),
                    last_delay_ms: None,
                };
                let locals = NodeLocals::Try {
                    phase: TryPhase::Body,
                    retry: retry.clone(),
                    error: None,
                };
                self.run.update(position, |n| n.locals = locals);
                (TryPhase::Body, retry, None)
            }
        };

        loop {
            match phase {
                TryPhase::RetryWait => match self.run.take_resumption(position) {
                    None => return Completion::Waiting,
                    Some(ResumePayload::TimedOut) => {
                        return Completion::Raised(timeout_error(position));
                    }
                    Some(_) => {
                        phase = TryPhase::Body;
                        let locals = NodeLocals::Try {
                            phase,
                            retry: retry.clone(),
                            error: caught.clone(),
                        };
                        self.run.update(position, |n| {
                            n.status = NodeStatus::Running;
                            n.locals = locals;
                        });
                        tracing::debug!(
                            instance_id = %self.run.instance_id,
                            position = %position,
                            attempt = retry.attempt,
                            "re-entering try body"
                        );
                    }
                },
                TryPhase::Catch => {
                    let Some(error) = caught else {
                        return Completion::Raised(
                            WorkflowError::runtime("Catch entered without an error").at(position),
                        );
                    };
                    let Some(tasks) = &catch.tasks else {
                        return Completion::Raised(error);
                    };
                    let catch_scope = scope.with_binding(catch.binding(), error_value(&error));
                    return self
                        .sequence(tasks, position, "catch", input, catch_scope)
                        .await;
                }
                TryPhase::Body => {
                    let body_scope = scope.with_attempt(retry.attempt);
                    let err = match self
                        .sequence(body, position, "try", input.clone(), body_scope)
                        .await
                    {
                        Completion::Raised(err) => err,
                        other => return other,
                    };

                    let env = extend_env(
                        scope.env(position, &input),
                        catch.binding(),
                        error_value(&err),
                    );
                    let decision = match ErrorPropagator::decide(
                        catch,
                        &retry,
                        &err,
                        Utc::now(),
                        self.evaluator,
                        &env,
                    ) {
                        Ok(decision) => decision,
                        Err(e) => return Completion::Raised(expression_error(e, position)),
                    };

                    match decision {
                        CatchDecision::Retry { attempt, delay } => {
                            return self.schedule_retry(position, scope, retry, attempt, delay, err);
                        }
                        CatchDecision::Catch => {
                            tracing::debug!(
                                instance_id = %self.run.instance_id,
                                position = %position,
                                error = %err,
                                "error caught"
                            );
                            phase = TryPhase::Catch;
                            caught = Some(err);
                            let locals = NodeLocals::Try {
                                phase,
                                retry: retry.clone(),
                                error: caught.clone(),
                            };
                            self.run.update(position, |n| n.locals = locals);
                        }
                        CatchDecision::Rethrow => return Completion::Raised(err),
                    }
                }
            }
        }
    }

    fn schedule_retry(
        &self,
        position: &NodePosition,
        scope: &Scope,
        mut retry: RetryState,
        attempt: u32,
        delay: std::time::Duration,
        error: WorkflowError,
    ) -> Completion {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let wake_at = after(delay);
        retry.attempt = attempt;
        retry.last_delay_ms = Some(delay_ms);

        self.clear_below(position);
        self.run.register(WaitRegistration::new(
            self.run.instance_id,
            position.clone(),
            new_token(),
            WaitKind::Retry { wake_at, attempt },
            scope.deadline,
        ));
        let locals = NodeLocals::Try {
            phase: TryPhase::RetryWait,
            retry,
            error: Some(error.clone()),
        };
        self.run.update(position, |n| {
            n.status = NodeStatus::RetryScheduled;
            n.locals = locals;
        });
        self.run.emit(EngineEvent::RetryScheduled {
            instance_id: self.run.instance_id,
            position: position.clone(),
            attempt,
            delay_ms,
        });
        tracing::info!(
            instance_id = %self.run.instance_id,
            position = %position,
            attempt,
            delay_ms,
            error = %error.title,
            "retry scheduled"
        );
        Completion::Waiting
    }

    // -----------------------------------------------------------------------
    // Leaves
    // -----------------------------------------------------------------------

    fn set(
        &self,
        set: &BTreeMap<String, Value>,
        position: &NodePosition,
        input: &Value,
        scope: &Scope,
    ) -> Completion {
        let template = Value::Object(set.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        match resolve_templates(self.evaluator, &template, &scope.env(position, input)) {
            Ok(output) => Completion::Completed {
                output,
                context: scope.context.clone(),
            },
            Err(e) => Completion::Raised(expression_error(e, position)),
        }
    }

    fn raise(
        &self,
        template: &ErrorTemplate,
        position: &NodePosition,
        input: &Value,
        scope: &Scope,
    ) -> WorkflowError {
        let error_type = if template.error_type.contains('/') {
            template.error_type.clone()
        } else {
            format!("{ERROR_TYPE_BASE}/{}", template.error_type)
        };
        let mut error = WorkflowError {
            error_type,
            status: 500,
            title: template.title.clone(),
            detail: None,
            instance: None,
        };
        error.status = template
            .status
            .or_else(|| error.kind().map(|k| k.default_status()))
            .unwrap_or(500);

        if let Some(detail) = &template.detail {
            let rendered = if is_runtime_expression(detail) {
                match self
                    .evaluator
                    .evaluate(strip_runtime_expression(detail), &scope.env(position, input))
                {
                    Ok(Value::String(s)) => s,
                    Ok(other) => other.to_string(),
                    Err(e) => return expression_error(e, position),
                }
            } else {
                detail.clone()
            };
            error.detail = Some(rendered);
        }
        error.at(position)
    }

    async fn call(
        &self,
        activity: &str,
        with: &BTreeMap<String, Value>,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        match self.leaf_state(position) {
            LeafState::Resumed(payload) => return resumed(payload, position, input, scope),
            LeafState::Parked => return Completion::Waiting,
            LeafState::Fresh => {}
        }

        let template = Value::Object(with.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        let arguments =
            match resolve_templates(self.evaluator, &template, &scope.env(position, &input)) {
                Ok(arguments) => arguments,
                Err(e) => return Completion::Raised(expression_error(e, position)),
            };

        let remaining = match scope.deadline {
            Some(deadline) => match (deadline - Utc::now()).to_std() {
                Ok(remaining) => Some(remaining),
                Err(_) => return Completion::Raised(timeout_error(position)),
            },
            None => None,
        };

        let instance_id = self.run.instance_id;
        let request = ActivityRequest {
            instance_id,
            position: position.clone(),
            activity: activity.to_string(),
            arguments,
            input: input.clone(),
            attempt: scope.attempt,
            idempotency_key: ActivityRequest::idempotency_key_for(
                instance_id,
                position,
                scope.attempt,
            ),
            cancel: scope.cancel.child_token(),
        };
        tracing::debug!(
            instance_id = %instance_id,
            position = %position,
            activity,
            key = %request.idempotency_key,
            "invoking activity"
        );

        let invocation = self.activities.invoke(request);
        let outcome = match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => return Completion::Raised(timeout_error(position)),
            },
            None => invocation.await,
        };

        match outcome {
            ActivityOutcome::Completed(output) => Completion::Completed {
                output,
                context: scope.context.clone(),
            },
            ActivityOutcome::Pending { token } => {
                self.park(
                    position,
                    WaitKind::Activity {
                        activity: activity.to_string(),
                    },
                    token,
                    scope.deadline,
                );
                Completion::Waiting
            }
            ActivityOutcome::Failed(err) => Completion::Raised(err.at(position)),
        }
    }

    fn wait(
        &self,
        duration: WorkflowDuration,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        match self.leaf_state(position) {
            LeafState::Resumed(payload) => resumed(payload, position, input, scope),
            LeafState::Parked => Completion::Waiting,
            LeafState::Fresh => {
                let wake_at = after(duration.to_std());
                self.park(position, WaitKind::Duration { wake_at }, new_token(), scope.deadline);
                Completion::Waiting
            }
        }
    }

    fn listen(
        &self,
        listen: &ListenSpec,
        position: &NodePosition,
        input: Value,
        scope: &Scope,
    ) -> Completion {
        match self.leaf_state(position) {
            LeafState::Resumed(payload) => return resumed(payload, position, input, scope),
            LeafState::Parked => return Completion::Waiting,
            LeafState::Fresh => {}
        }

        // Explicit expectations are fixed now; the rest are learned from events.
        let env = scope.env(position, &input);
        let mut expectations = BTreeMap::new();
        for filter in listen.to.conditions() {
            for (key, correlation) in &filter.correlate {
                let expected = match &correlation.expect {
                    Some(Expectation::Value(value)) => value.clone(),
                    Some(Expectation::Expr(expr)) => match self.evaluator.evaluate(expr, &env) {
                        Ok(value) => value,
                        Err(e) => return Completion::Raised(expression_error(e, position)),
                    },
                    None => continue,
                };
                expectations.insert(key.clone(), expected);
            }
        }

        let deadline = earliest(listen.timeout.map(|t| after(t.to_std())), scope.deadline);
        self.park(
            position,
            WaitKind::Event {
                listen: listen.clone(),
                expectations,
                correlation: CorrelationState::default(),
            },
            new_token(),
            deadline,
        );
        Completion::Waiting
    }

    fn leaf_state(&self, position: &NodePosition) -> LeafState {
        if let Some(payload) = self.run.take_resumption(position) {
            return LeafState::Resumed(payload);
        }
        match self.run.node(position) {
            Some(node) if node.status == NodeStatus::Waiting => LeafState::Parked,
            _ => LeafState::Fresh,
        }
    }

    fn park(
        &self,
        position: &NodePosition,
        kind: WaitKind,
        token: String,
        deadline: Option<DateTime<Utc>>,
    ) {
        tracing::debug!(
            instance_id = %self.run.instance_id,
            position = %position,
            kind = kind.label(),
            token = %token,
            "task waiting"
        );
        self.run.register(WaitRegistration::new(
            self.run.instance_id,
            position.clone(),
            token,
            kind,
            deadline,
        ));
        self.run.update(position, |n| n.status = NodeStatus::Waiting);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resumed(payload: ResumePayload, position: &NodePosition, input: Value, scope: &Scope) -> Completion {
    match payload {
        ResumePayload::Timer => Completion::Completed {
            output: input,
            context: scope.context.clone(),
        },
        ResumePayload::Completed { output } => Completion::Completed {
            output,
            context: scope.context.clone(),
        },
        ResumePayload::Failed { error } => Completion::Raised(error.at(position)),
        ResumePayload::TimedOut => Completion::Raised(timeout_error(position)),
    }
}

/// Fold branch contexts into `base` in declaration order.
///
/// Object contexts merge the keys a branch changed; any other shape replaces
/// the context wholesale.
fn merge_contexts(base: &Value, branches: Vec<Value>) -> Value {
    let mut merged = base.clone();
    for context in branches {
        if context == *base {
            continue;
        }
        match (&mut merged, context) {
            (Value::Object(target), Value::Object(changes)) => {
                let original = base.as_object();
                for (key, value) in changes {
                    if original.and_then(|o| o.get(&key)) != Some(&value) {
                        target.insert(key, value);
                    }
                }
            }
            (slot, other) => *slot = other,
        }
    }
    merged
}

fn expression_error(err: ExpressionError, position: &NodePosition) -> WorkflowError {
    WorkflowError::expression("Expression evaluation failed")
        .with_detail(err.to_string())
        .at(position)
}

fn timeout_error(position: &NodePosition) -> WorkflowError {
    WorkflowError::timeout("Task timed out")
        .with_detail(format!("deadline of {position} passed"))
        .at(position)
}

fn error_value(error: &WorkflowError) -> Value {
    serde_json::to_value(error).unwrap_or(Value::Null)
}

fn new_token() -> String {
    Uuid::now_v7().to_string()
}

fn after(delay: std::time::Duration) -> DateTime<Utc> {
    after_from(Utc::now(), delay)
}

/// `from + delay`, clamped to the latest representable instant.
pub(crate) fn after_from(from: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
