//! Event envelopes and `listen` configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duration::WorkflowDuration;

// ---------------------------------------------------------------------------
// EventEnvelope
// ---------------------------------------------------------------------------

/// An inbound event in CloudEvents shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// Extension attributes.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl EventEnvelope {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            subject: None,
            time: None,
            datacontenttype: None,
            data,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Look up a context attribute or extension by name.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.event_type.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            "datacontenttype" => self.datacontenttype.clone().map(Value::String),
            "data" => Some(self.data.clone()),
            other => self.extensions.get(other).cloned(),
        }
    }

    /// The envelope as a JSON object (attributes plus `data`).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Listen configuration
// ---------------------------------------------------------------------------

/// How an envelope attribute is matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeMatcher {
    /// Attribute must equal the value.
    Exact(Value),
    /// Attribute must be a string matching the regex.
    Regex(String),
    /// Expression over `event` that must evaluate true.
    Expr(String),
}

/// Expected value of a correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Value(Value),
    /// Resolved against the node input and context when the wait is registered.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// Expression extracting the key from the event.
    pub from: String,
    /// Without an expectation the first extracted value becomes the expectation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Expectation>,
}

/// One event condition of a `listen` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, AttributeMatcher>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlate: BTreeMap<String, CorrelationKey>,
}

impl EventFilter {
    pub fn with_type(event_type: impl Into<String>) -> Self {
        let mut with = BTreeMap::new();
        with.insert(
            "type".to_string(),
            AttributeMatcher::Exact(Value::String(event_type.into())),
        );
        Self {
            with,
            correlate: BTreeMap::new(),
        }
    }

    pub fn correlate(mut self, key: impl Into<String>, from: impl Into<String>) -> Self {
        self.correlate.insert(
            key.into(),
            CorrelationKey {
                from: from.into(),
                expect: None,
            },
        );
        self
    }

    pub fn correlate_expecting(
        mut self,
        key: impl Into<String>,
        from: impl Into<String>,
        expect: Expectation,
    ) -> Self {
        self.correlate.insert(
            key.into(),
            CorrelationKey {
                from: from.into(),
                expect: Some(expect),
            },
        );
        self
    }

    /// The exact `type` this filter requires, if it requires one.
    pub fn exact_type(&self) -> Option<&str> {
        match self.with.get("type") {
            Some(AttributeMatcher::Exact(Value::String(t))) => Some(t),
            _ => None,
        }
    }
}

/// Consumption policy of a listen task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionPolicy {
    /// Complete on the first matching event.
    One(EventFilter),
    /// Complete on the first event matching any condition, or accumulate
    /// until `until` holds when one is given.
    Any(Vec<EventFilter>),
    /// Complete once every condition has matched.
    All(Vec<EventFilter>),
}

impl ConsumptionPolicy {
    pub fn conditions(&self) -> &[EventFilter] {
        match self {
            ConsumptionPolicy::One(filter) => std::slice::from_ref(filter),
            ConsumptionPolicy::Any(filters) | ConsumptionPolicy::All(filters) => filters,
        }
    }
}

/// Stop condition for accumulating policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UntilCondition {
    /// A matching event stops accumulation and is not part of the output.
    Event(EventFilter),
    /// Evaluated over the accumulated events (bound as `events`).
    Expr(String),
}

/// Shape of each consumed event in the listen output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    #[default]
    Data,
    Envelope,
    Raw,
}

/// `listen` task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenSpec {
    pub to: ConsumptionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<UntilCondition>,
    #[serde(default)]
    pub read: ReadMode,
    /// Correlation deadline measured from registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<WorkflowDuration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_exposes_extensions_as_attributes() {
        let env: EventEnvelope = serde_json::from_value(json!({
            "id": "e1", "source": "/orders", "type": "order.paid",
            "data": { "orderId": "o-1" },
            "tenant": "acme"
        }))
        .unwrap();
        assert_eq!(env.attribute("type"), Some(json!("order.paid")));
        assert_eq!(env.attribute("tenant"), Some(json!("acme")));
        assert_eq!(env.attribute("subject"), None);
    }

    #[test]
    fn listen_spec_deserializes() {
        let spec: ListenSpec = serde_json::from_value(json!({
            "to": { "all": [
                { "with": { "type": { "exact": "a" } } },
                { "with": { "type": { "regex": "^b\\." } },
                  "correlate": { "order": { "from": "event.data.orderId" } } }
            ] },
            "read": "envelope",
            "timeout": { "minutes": 5 }
        }))
        .unwrap();
        assert_eq!(spec.to.conditions().len(), 2);
        assert_eq!(spec.read, ReadMode::Envelope);
        assert_eq!(spec.to.conditions()[0].exact_type(), Some("a"));
        assert!(spec.to.conditions()[1].correlate.contains_key("order"));
    }
}
