//! Event correlation engine.
//!
//! Offers inbound envelopes to every open `listen` registration. Per
//! registration the event goes through:
//!
//! 1. the `until` event filter, which closes an accumulating wait without
//!    contributing the event itself
//! 2. the attribute filters of each consumption condition
//! 3. the correlation keys, checked against explicit expectations or values
//!    learned from earlier events of the same registration
//!
//! Accepted events accumulate on the registration row under a per-token
//! mutex and the row version. When the consumption policy is satisfied the
//! registration is fired and a resume record is enqueued in one transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;
use waypost_types::correlation::{
    AttributeMatcher, ConsumptionPolicy, EventEnvelope, EventFilter, ReadMode, UntilCondition,
};
use waypost_types::error::RepositoryError;
use waypost_types::event::EngineEvent;
use waypost_types::outbox::NewOutboxRecord;
use waypost_types::wait::{CorrelationState, MatchedEvent, ResumePayload, WaitKind, WaitRegistration};

use super::expression::ExpressionEvaluator;
use crate::repository::InstanceRepository;

/// Reload-and-retry budget for a registration row that moved underneath us.
const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// What accepting an event does to a registration.
#[derive(Debug, Clone, PartialEq)]
struct Accepted {
    correlation: CorrelationState,
    complete: bool,
}

pub struct CorrelationEngine {
    evaluator: Arc<dyn ExpressionEvaluator>,
    regexes: DashMap<String, Regex>,
    locks: DashMap<(Uuid, String), Arc<Mutex<()>>>,
    conflict_retries: u32,
}

impl CorrelationEngine {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            evaluator,
            regexes: DashMap::new(),
            locks: DashMap::new(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Offer one event to every open listen registration.
    ///
    /// Returns an `EventCorrelated` event per registration that accepted it.
    /// Registrations whose deadline has passed accept nothing; the scheduler
    /// times them out.
    pub async fn offer<R: InstanceRepository>(
        &self,
        repo: &R,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Vec<EngineEvent>, RepositoryError> {
        let candidates = repo.open_event_registrations().await?;
        let mut correlated = Vec::new();

        for candidate in candidates {
            let key = (candidate.instance_id, candidate.token.clone());
            let lock = self.lock_for(&key);
            let guard = lock.lock().await;
            let outcome = self
                .offer_one(repo, &candidate.instance_id, &candidate.token, event, now)
                .await;
            drop(guard);
            drop(lock);
            self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

            if let Some(accepted) = outcome? {
                correlated.push(accepted);
            }
        }

        Ok(correlated)
    }

    async fn offer_one<R: InstanceRepository>(
        &self,
        repo: &R,
        instance_id: &Uuid,
        token: &str,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<EngineEvent>, RepositoryError> {
        for _ in 0..=self.conflict_retries {
            let Some(registration) = repo.get_registration(instance_id, token).await? else {
                return Ok(None);
            };
            if !registration.is_open() || registration.is_expired(now) {
                return Ok(None);
            }
            let Some(accepted) = self.evaluate(&registration, event) else {
                return Ok(None);
            };

            match self.persist(repo, &registration, accepted.clone()).await {
                Ok(()) => {
                    tracing::debug!(
                        instance_id = %registration.instance_id,
                        position = %registration.position,
                        event_id = %event.id,
                        completed = accepted.complete,
                        "event correlated"
                    );
                    return Ok(Some(EngineEvent::EventCorrelated {
                        instance_id: registration.instance_id,
                        position: registration.position,
                        event_id: event.id.clone(),
                        completed: accepted.complete,
                    }));
                }
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::debug!(token, %reason, "registration moved, re-evaluating");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(token, event_id = %event.id, "gave up correlating event after conflicts");
        Ok(None)
    }

    /// Decide whether `registration` accepts `event`, without side effects.
    fn evaluate(&self, registration: &WaitRegistration, event: &EventEnvelope) -> Option<Accepted> {
        let WaitKind::Event {
            listen,
            expectations,
            correlation,
        } = &registration.kind
        else {
            return None;
        };
        if correlation.matched.iter().any(|m| m.event.id == event.id) {
            return None;
        }

        if let Some(UntilCondition::Event(until)) = &listen.until {
            if self.filter_matches(until, event)
                && self
                    .correlates(until, event, expectations, &correlation.learned)
                    .is_some()
            {
                return Some(Accepted {
                    correlation: correlation.clone(),
                    complete: true,
                });
            }
        }

        let conditions = listen.to.conditions();
        let all = matches!(listen.to, ConsumptionPolicy::All(_));
        for (index, filter) in conditions.iter().enumerate() {
            if all && correlation.is_condition_satisfied(index) {
                continue;
            }
            if !self.filter_matches(filter, event) {
                continue;
            }
            let Some(learned) = self.correlates(filter, event, expectations, &correlation.learned)
            else {
                continue;
            };

            let mut next = correlation.clone();
            next.learned.extend(learned);
            next.matched.push(MatchedEvent {
                condition: index,
                event: event.clone(),
            });

            let complete = match &listen.to {
                ConsumptionPolicy::One(_) => true,
                ConsumptionPolicy::All(filters) => {
                    (0..filters.len()).all(|c| next.is_condition_satisfied(c))
                        || self.until_holds(listen.until.as_ref(), listen.read, &next)
                }
                ConsumptionPolicy::Any(_) => match &listen.until {
                    None => true,
                    until @ Some(_) => self.until_holds(until.as_ref(), listen.read, &next),
                },
            };
            return Some(Accepted {
                correlation: next,
                complete,
            });
        }
        None
    }

    /// `until: {expr}` over the events accepted so far. Event filters are
    /// handled before consumption and never hold here.
    fn until_holds(
        &self,
        until: Option<&UntilCondition>,
        read: ReadMode,
        correlation: &CorrelationState,
    ) -> bool {
        let Some(UntilCondition::Expr(expr)) = until else {
            return false;
        };
        let env = json!({ "events": render(read, &correlation.matched) });
        self.evaluator.evaluate_bool(expr, &env).unwrap_or_else(|e| {
            tracing::warn!(expr = %expr, error = %e, "until expression failed");
            false
        })
    }

    async fn persist<R: InstanceRepository>(
        &self,
        repo: &R,
        registration: &WaitRegistration,
        accepted: Accepted,
    ) -> Result<(), RepositoryError> {
        let WaitKind::Event {
            listen,
            expectations,
            ..
        } = &registration.kind
        else {
            return Ok(());
        };
        let output = render(listen.read, &accepted.correlation.matched);
        let mut updated = registration.clone();
        updated.kind = WaitKind::Event {
            listen: listen.clone(),
            expectations: expectations.clone(),
            correlation: accepted.correlation,
        };

        if accepted.complete {
            let payload = serde_json::to_value(ResumePayload::Completed { output })
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let record = NewOutboxRecord::resume(
                registration.instance_id,
                registration.token.clone(),
                payload,
            );
            repo.fire_registration(&updated, registration.version, record)
                .await
        } else {
            repo.update_registration(&updated, registration.version)
                .await
        }
    }

    /// Every attribute filter of `filter` holds for `event`.
    fn filter_matches(&self, filter: &EventFilter, event: &EventEnvelope) -> bool {
        filter.with.iter().all(|(attribute, matcher)| {
            let value = event.attribute(attribute);
            match matcher {
                AttributeMatcher::Exact(expected) => {
                    value.is_some_and(|v| values_equal(&v, expected))
                }
                AttributeMatcher::Regex(pattern) => match value {
                    Some(Value::String(s)) => self.regex(pattern).is_some_and(|r| r.is_match(&s)),
                    _ => false,
                },
                AttributeMatcher::Expr(expr) => {
                    let env = json!({ "event": event.to_value(), "value": value });
                    self.evaluator.evaluate_bool(expr, &env).unwrap_or(false)
                }
            }
        })
    }

    /// Check correlation keys; returns the values to learn on acceptance.
    fn correlates(
        &self,
        filter: &EventFilter,
        event: &EventEnvelope,
        expectations: &BTreeMap<String, Value>,
        learned: &BTreeMap<String, Value>,
    ) -> Option<BTreeMap<String, Value>> {
        let env = json!({ "event": event.to_value() });
        let mut fresh = BTreeMap::new();
        for (key, correlation) in &filter.correlate {
            let value = match self.evaluator.evaluate(&correlation.from, &env) {
                Ok(Value::Null) | Err(_) => return None,
                Ok(value) => value,
            };
            let expected = expectations
                .get(key)
                .or_else(|| learned.get(key))
                .or_else(|| fresh.get(key));
            match expected {
                Some(expected) if !values_equal(expected, &value) => return None,
                Some(_) => {}
                None => {
                    fresh.insert(key.clone(), value);
                }
            }
        }
        Some(fresh)
    }

    fn regex(&self, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self.regexes.get(pattern) {
            return Some(cached.clone());
        }
        match Regex::new(pattern) {
            Ok(compiled) => {
                self.regexes.insert(pattern.to_string(), compiled.clone());
                Some(compiled)
            }
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid attribute regex");
                None
            }
        }
    }

    fn lock_for(&self, key: &(Uuid, String)) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("cached_regexes", &self.regexes.len())
            .field("conflict_retries", &self.conflict_retries)
            .finish()
    }
}

/// Accepted events in arrival order, shaped by the read mode.
fn render(read: ReadMode, matched: &[MatchedEvent]) -> Value {
    Value::Array(
        matched
            .iter()
            .map(|m| match read {
                ReadMode::Data => m.event.data.clone(),
                ReadMode::Envelope => m.event.to_value(),
                ReadMode::Raw => match &m.event.data {
                    Value::String(s) => Value::String(s.clone()),
                    other => Value::String(other.to_string()),
                },
            })
            .collect(),
    )
}

/// JSON equality that treats numerically equal numbers as equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, InstanceCommit};
    use crate::workflow::expression::JexlEvaluator;
    use chrono::Duration;
    use uuid::Uuid;
    use waypost_types::correlation::ListenSpec;
    use waypost_types::definition::DefinitionRef;
    use waypost_types::instance::WorkflowInstance;
    use waypost_types::outbox::{OutboxStatus, OutboxTarget};
    use waypost_types::wait::RegistrationState;

    fn engine() -> CorrelationEngine {
        CorrelationEngine::new(Arc::new(JexlEvaluator::new()))
    }

    async fn listening(
        repo: &InMemoryRepository,
        listen: Value,
        expectations: BTreeMap<String, Value>,
        deadline: Option<DateTime<Utc>>,
    ) -> WaitRegistration {
        let listen: ListenSpec = serde_json::from_value(listen).unwrap();
        let instance =
            WorkflowInstance::new(DefinitionRef::new("ns", "wf", "1.0.0"), json!({}), json!({}));
        let registration = WaitRegistration::new(
            instance.id,
            "/do/wait".parse().unwrap(),
            Uuid::now_v7().to_string(),
            WaitKind::Event {
                listen,
                expectations,
                correlation: CorrelationState::default(),
            },
            deadline,
        );
        let mut commit = InstanceCommit::create(instance);
        commit.upsert_registrations.push(registration.clone());
        repo.commit(commit).await.unwrap();
        registration
    }

    fn event(id: &str, event_type: &str, data: Value) -> EventEnvelope {
        EventEnvelope::new(id, "/test", event_type, data)
    }

    /// Output of the resume record enqueued for `token`, if any.
    async fn resumed_output(repo: &InMemoryRepository, token: &str) -> Option<Value> {
        repo.list_outbox(Some(OutboxStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .find_map(|r| match r.target {
                OutboxTarget::Resume { token: t, .. } if t == token => {
                    match serde_json::from_value(r.payload).unwrap() {
                        ResumePayload::Completed { output } => Some(output),
                        other => panic!("unexpected payload {other:?}"),
                    }
                }
                _ => None,
            })
    }

    fn all_of_paid_and_shipped() -> Value {
        json!({ "to": { "all": [
            { "with": { "type": { "exact": "order.paid" } },
              "correlate": { "order": { "from": "event.data.orderId" } } },
            { "with": { "type": { "exact": "order.shipped" } },
              "correlate": { "order": { "from": "event.data.orderId" } } }
        ] } })
    }

    #[tokio::test]
    async fn all_completes_in_either_arrival_order() {
        let paid = event("e1", "order.paid", json!({ "orderId": "o-1", "step": "paid" }));
        let shipped = event("e2", "order.shipped", json!({ "orderId": "o-1", "step": "shipped" }));

        for (first, second) in [(&paid, &shipped), (&shipped, &paid)] {
            let repo = InMemoryRepository::new();
            let reg = listening(&repo, all_of_paid_and_shipped(), BTreeMap::new(), None).await;
            let correlation = engine();

            let after_first = correlation.offer(&repo, first, Utc::now()).await.unwrap();
            assert!(matches!(after_first[..], [EngineEvent::EventCorrelated { completed: false, .. }]));
            assert!(resumed_output(&repo, &reg.token).await.is_none());

            let after_second = correlation.offer(&repo, second, Utc::now()).await.unwrap();
            assert!(matches!(after_second[..], [EngineEvent::EventCorrelated { completed: true, .. }]));

            let output = resumed_output(&repo, &reg.token).await.unwrap();
            assert_eq!(output, json!([first.data, second.data]));
            let stored = repo.get_registration(&reg.instance_id, &reg.token).await.unwrap().unwrap();
            assert_eq!(stored.state, RegistrationState::Fired);
        }
    }

    #[tokio::test]
    async fn learned_key_rejects_other_instances_events() {
        let repo = InMemoryRepository::new();
        let reg = listening(&repo, all_of_paid_and_shipped(), BTreeMap::new(), None).await;
        let correlation = engine();

        correlation
            .offer(&repo, &event("e1", "order.paid", json!({ "orderId": "o-1" })), Utc::now())
            .await
            .unwrap();
        let foreign = correlation
            .offer(&repo, &event("e2", "order.shipped", json!({ "orderId": "o-2" })), Utc::now())
            .await
            .unwrap();
        assert!(foreign.is_empty());

        let stored = repo.get_registration(&reg.instance_id, &reg.token).await.unwrap().unwrap();
        let WaitKind::Event { correlation, .. } = stored.kind else {
            panic!("expected event wait");
        };
        assert_eq!(correlation.learned["order"], json!("o-1"));
        assert_eq!(correlation.matched.len(), 1);
    }

    #[tokio::test]
    async fn explicit_expectation_filters_events() {
        let repo = InMemoryRepository::new();
        let listen = json!({ "to": { "one": {
            "with": { "type": { "regex": "^order\\." } },
            "correlate": { "order": { "from": "event.data.orderId", "expect": { "expr": "input.orderId" } } }
        } } });
        let mut expectations = BTreeMap::new();
        expectations.insert("order".to_string(), json!("o-7"));
        let reg = listening(&repo, listen, expectations, None).await;
        let correlation = engine();

        let miss = correlation
            .offer(&repo, &event("e1", "order.paid", json!({ "orderId": "o-1" })), Utc::now())
            .await
            .unwrap();
        assert!(miss.is_empty());

        correlation
            .offer(&repo, &event("e2", "order.paid", json!({ "orderId": "o-7" })), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            resumed_output(&repo, &reg.token).await,
            Some(json!([{ "orderId": "o-7" }]))
        );
    }

    #[tokio::test]
    async fn until_event_closes_without_itself() {
        let repo = InMemoryRepository::new();
        let listen = json!({
            "to": { "any": [ { "with": { "type": { "exact": "batch.item" } } } ] },
            "until": { "event": { "with": { "type": { "exact": "batch.closed" } } } }
        });
        let reg = listening(&repo, listen, BTreeMap::new(), None).await;
        let correlation = engine();

        for (id, n) in [("i1", 1), ("i2", 2)] {
            correlation
                .offer(&repo, &event(id, "batch.item", json!({ "n": n })), Utc::now())
                .await
                .unwrap();
        }
        assert!(resumed_output(&repo, &reg.token).await.is_none());

        correlation
            .offer(&repo, &event("c", "batch.closed", json!({ "n": 99 })), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            resumed_output(&repo, &reg.token).await,
            Some(json!([{ "n": 1 }, { "n": 2 }]))
        );
    }

    #[tokio::test]
    async fn until_expression_sees_accumulated_events() {
        let repo = InMemoryRepository::new();
        let listen = json!({
            "to": { "any": [ { "with": { "type": { "exact": "tick" } } } ] },
            "until": { "expr": "events|length > 1" },
            "read": "raw"
        });
        let reg = listening(&repo, listen, BTreeMap::new(), None).await;
        let correlation = engine();

        correlation.offer(&repo, &event("t1", "tick", json!("a")), Utc::now()).await.unwrap();
        assert!(resumed_output(&repo, &reg.token).await.is_none());
        correlation.offer(&repo, &event("t2", "tick", json!("b")), Utc::now()).await.unwrap();
        assert_eq!(resumed_output(&repo, &reg.token).await, Some(json!(["a", "b"])));
    }

    #[tokio::test]
    async fn until_expression_closes_all_before_every_condition_matched() {
        let repo = InMemoryRepository::new();
        let listen = json!({
            "to": { "all": [
                { "with": { "type": { "exact": "order.paid" } } },
                { "with": { "type": { "exact": "order.shipped" } } },
                { "with": { "type": { "exact": "order.delivered" } } }
            ] },
            "until": { "expr": "events|length > 1" },
            "read": "raw"
        });
        let reg = listening(&repo, listen, BTreeMap::new(), None).await;
        let correlation = engine();

        correlation.offer(&repo, &event("e1", "order.paid", json!("paid")), Utc::now()).await.unwrap();
        assert!(resumed_output(&repo, &reg.token).await.is_none());
        let closed = correlation
            .offer(&repo, &event("e2", "order.shipped", json!("shipped")), Utc::now())
            .await
            .unwrap();
        assert!(matches!(closed[..], [EngineEvent::EventCorrelated { completed: true, .. }]));
        assert_eq!(resumed_output(&repo, &reg.token).await, Some(json!(["paid", "shipped"])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_engines_record_both_all_conditions() {
        for round in 0..50 {
            let repo = InMemoryRepository::new();
            let reg = listening(&repo, all_of_paid_and_shipped(), BTreeMap::new(), None).await;
            let paid = event(&format!("p{round}"), "order.paid", json!({ "orderId": "o-1", "step": "paid" }));
            let shipped = event(&format!("s{round}"), "order.shipped", json!({ "orderId": "o-1", "step": "shipped" }));

            let offer = |correlation: Arc<CorrelationEngine>, envelope: EventEnvelope| {
                let repo = repo.clone();
                tokio::spawn(async move { correlation.offer(&repo, &envelope, Utc::now()).await })
            };
            let (left, right) = tokio::join!(
                offer(Arc::new(engine()), paid),
                offer(Arc::new(engine()), shipped)
            );
            let completed = [left.unwrap().unwrap(), right.unwrap().unwrap()]
                .iter()
                .flatten()
                .filter(|e| matches!(e, EngineEvent::EventCorrelated { completed: true, .. }))
                .count();
            assert_eq!(completed, 1, "round {round}");

            let output = resumed_output(&repo, &reg.token).await.unwrap();
            let mut steps: Vec<&str> = output
                .as_array()
                .unwrap()
                .iter()
                .filter_map(|e| e["step"].as_str())
                .collect();
            steps.sort_unstable();
            assert_eq!(steps, vec!["paid", "shipped"], "round {round}");
            let stored = repo.get_registration(&reg.instance_id, &reg.token).await.unwrap().unwrap();
            assert_eq!(stored.state, RegistrationState::Fired);
        }
    }

    #[tokio::test]
    async fn expired_registration_accepts_nothing() {
        let repo = InMemoryRepository::new();
        let listen = json!({ "to": { "one": { "with": { "type": { "exact": "late" } } } } });
        let reg = listening(&repo, listen, BTreeMap::new(), Some(Utc::now() - Duration::seconds(1))).await;

        let accepted = engine()
            .offer(&repo, &event("e1", "late", json!({})), Utc::now())
            .await
            .unwrap();
        assert!(accepted.is_empty());
        let stored = repo.get_registration(&reg.instance_id, &reg.token).await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
        assert!(resumed_output(&repo, &reg.token).await.is_none());
    }

    #[tokio::test]
    async fn redelivered_event_is_counted_once() {
        let repo = InMemoryRepository::new();
        let reg = listening(&repo, all_of_paid_and_shipped(), BTreeMap::new(), None).await;
        let correlation = engine();
        let paid = event("e1", "order.paid", json!({ "orderId": "o-1" }));

        correlation.offer(&repo, &paid, Utc::now()).await.unwrap();
        let again = correlation.offer(&repo, &paid, Utc::now()).await.unwrap();
        assert!(again.is_empty());
        let stored = repo.get_registration(&reg.instance_id, &reg.token).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(!values_equal(&json!("2"), &json!(2)));
    }
}
