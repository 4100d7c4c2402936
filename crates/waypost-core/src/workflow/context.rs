//! Data context threaded through the task tree.
//!
//! A `Scope` carries everything an expression may reference besides the
//! node input: the instance context value, the workflow descriptor, loop and
//! catch bindings, and the tightest deadline inherited from enclosing nodes.
//! Scopes are cheap clones passed down by value; a child never mutates its
//! parent's scope.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypost_types::definition::DefinitionRef;
use waypost_types::error::WorkflowError;
use waypost_types::position::NodePosition;

/// Maximum serialized size of the context value (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

#[derive(Debug, Clone)]
pub struct Scope {
    pub instance_id: Uuid,
    pub definition: DefinitionRef,
    pub workflow_input: Value,
    /// Current context value.
    pub context: Value,
    /// Named bindings (`item`, `index`, `error`, ...).
    pub bindings: Map<String, Value>,
    /// Earliest deadline of the enclosing nodes and the workflow.
    pub deadline: Option<DateTime<Utc>>,
    /// Retry attempt of the nearest enclosing try.
    pub attempt: u32,
    /// Cancelled when the instance is cancelled or the enclosing branch loses.
    pub cancel: CancellationToken,
}

impl Scope {
    pub fn new(
        instance_id: Uuid,
        definition: DefinitionRef,
        workflow_input: Value,
        context: Value,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            instance_id,
            definition,
            workflow_input,
            context,
            bindings: Map::new(),
            deadline,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        let mut scope = self.clone();
        scope.cancel = cancel;
        scope
    }

    pub fn with_context(&self, context: Value) -> Self {
        let mut scope = self.clone();
        scope.context = context;
        scope
    }

    pub fn with_binding(&self, name: &str, value: Value) -> Self {
        let mut scope = self.clone();
        scope.bindings.insert(name.to_string(), value);
        scope
    }

    pub fn with_attempt(&self, attempt: u32) -> Self {
        let mut scope = self.clone();
        scope.attempt = attempt;
        scope
    }

    /// Narrow the inherited deadline.
    pub fn with_deadline(&self, deadline: Option<DateTime<Utc>>) -> Self {
        let mut scope = self.clone();
        scope.deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        scope
    }

    /// Evaluation environment for a node at `position` receiving `input`.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "input": <node input>,
    ///   "context": <context value>,
    ///   "workflow": { "id": "...", "namespace": "...", "name": "...",
    ///                 "version": "...", "input": <workflow input> },
    ///   "task": { "name": "...", "position": "/do/..." },
    ///   "<binding>": <value>, ...
    /// }
    /// ```
    pub fn env(&self, position: &NodePosition, input: &Value) -> Value {
        let mut env = self.bindings.clone();
        env.insert("input".to_string(), input.clone());
        env.insert("context".to_string(), self.context.clone());
        env.insert(
            "workflow".to_string(),
            json!({
                "id": self.instance_id.to_string(),
                "namespace": self.definition.namespace,
                "name": self.definition.name,
                "version": self.definition.version,
                "input": self.workflow_input,
            }),
        );
        env.insert(
            "task".to_string(),
            json!({
                "name": position.name(),
                "position": position.to_string(),
            }),
        );
        Value::Object(env)
    }
}

/// Return `env` with one extra top-level key.
pub fn extend_env(mut env: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut env {
        map.insert(key.to_string(), value);
    }
    env
}

/// Reject context values above `MAX_CONTEXT_SIZE`.
pub fn check_context_size(context: &Value) -> Result<(), WorkflowError> {
    let size = serde_json::to_vec(context).map(|v| v.len()).unwrap_or(0);
    if size > MAX_CONTEXT_SIZE {
        tracing::warn!(size, max = MAX_CONTEXT_SIZE, "context exceeds size limit");
        return Err(WorkflowError::runtime("Context too large").with_detail(format!(
            "context size ({size} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new(
            Uuid::now_v7(),
            DefinitionRef::new("ns", "flow", "1.0.0"),
            json!({ "orderId": "o-1" }),
            json!({ "seen": 1 }),
            None,
        )
    }

    #[test]
    fn env_exposes_input_context_workflow_and_bindings() {
        let pos = NodePosition::root().child("do", "step");
        let env = scope()
            .with_binding("item", json!("x"))
            .env(&pos, &json!({ "a": 1 }));
        assert_eq!(env["input"], json!({ "a": 1 }));
        assert_eq!(env["context"], json!({ "seen": 1 }));
        assert_eq!(env["workflow"]["name"], "flow");
        assert_eq!(env["workflow"]["input"]["orderId"], "o-1");
        assert_eq!(env["task"]["position"], "/do/step");
        assert_eq!(env["item"], "x");
    }

    #[test]
    fn child_scope_does_not_leak_into_parent() {
        let parent = scope();
        let child = parent.with_binding("error", json!({})).with_context(json!({}));
        assert!(parent.bindings.is_empty());
        assert_eq!(parent.context, json!({ "seen": 1 }));
        assert!(child.bindings.contains_key("error"));
    }

    #[test]
    fn deadline_only_narrows() {
        let now = Utc::now();
        let early = now + chrono::Duration::seconds(5);
        let late = now + chrono::Duration::seconds(50);
        let s = scope().with_deadline(Some(early)).with_deadline(Some(late));
        assert_eq!(s.deadline, Some(early));
        assert_eq!(s.with_deadline(None).deadline, Some(early));
    }

    #[test]
    fn extend_env_adds_key() {
        let env = extend_env(json!({ "input": 1 }), "output", json!(2));
        assert_eq!(env, json!({ "input": 1, "output": 2 }));
    }

    #[test]
    fn oversized_context_is_rejected() {
        let big = Value::String("x".repeat(MAX_CONTEXT_SIZE + 1));
        assert!(check_context_size(&big).is_err());
        assert!(check_context_size(&json!({})).is_ok());
    }
}
