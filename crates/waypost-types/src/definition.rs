//! Workflow definition types.
//!
//! `WorkflowDefinition` is the immutable, versioned task tree the engine
//! executes. Task kinds form a closed enum; every kind carries its own
//! fields, and the interpreter matches on it exhaustively.
//!
//! ```json
//! {
//!   "document": { "namespace": "shop", "name": "checkout", "version": "1.0.0" },
//!   "do": [
//!     { "name": "reserve", "type": "call", "call": "inventory.reserve" },
//!     { "name": "pay", "type": "try",
//!       "try": [ { "name": "charge", "type": "call", "call": "payments.charge" } ],
//!       "catch": { "retry": { "delay": { "seconds": 1 }, "backoff": "exponential" } } }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::ListenSpec;
use crate::duration::WorkflowDuration;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Definition identity
// ---------------------------------------------------------------------------

/// Identity of a definition: `(namespace, name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl DefinitionRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.version)
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// An immutable workflow definition.
///
/// Shared read-only across every instance started from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub document: DefinitionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the workflow input, checked by the schema validator port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// JSON schema for the workflow output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Initial value of the instance context (defaults to `{}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Workflow-level deadline measured from instance start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<WorkflowDuration>,
    /// Root task list, executed as a sequence.
    #[serde(rename = "do")]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A named node of the task tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique among siblings.
    pub name: String,
    /// Guard expression; when it evaluates false the task is skipped and its
    /// output is its unmodified input.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Expression shaping the task input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_from: Option<String>,
    /// Expression shaping the task output (`output` is bound to the raw output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_as: Option<String>,
    /// Expression whose value replaces the context after the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_as: Option<String>,
    /// Node-level timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<WorkflowDuration>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl Task {
    /// A task with no guard, transforms or timeout.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            guard: None,
            input_from: None,
            output_as: None,
            export_as: None,
            timeout: None,
            kind,
        }
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn with_input_from(mut self, expr: impl Into<String>) -> Self {
        self.input_from = Some(expr.into());
        self
    }

    pub fn with_output_as(mut self, expr: impl Into<String>) -> Self {
        self.output_as = Some(expr.into());
        self
    }

    pub fn with_export_as(mut self, expr: impl Into<String>) -> Self {
        self.export_as = Some(expr.into());
        self
    }

    pub fn with_timeout(mut self, timeout: WorkflowDuration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The closed set of task kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run child tasks in order.
    Do {
        #[serde(rename = "do")]
        tasks: Vec<Task>,
    },
    /// First case whose `when` holds wins; a case without `when` is the default.
    Switch { cases: Vec<SwitchCase> },
    /// Iterate over a collection.
    For(ForSpec),
    /// Run branches concurrently.
    Fork {
        branches: Vec<Task>,
        /// Race mode: the first completed branch wins.
        #[serde(default)]
        compete: bool,
    },
    /// Run a body, intercepting failures.
    Try {
        #[serde(rename = "try")]
        body: Vec<Task>,
        catch: CatchSpec,
    },
    /// Produce an object; `${ expr }` strings are evaluated.
    Set { set: BTreeMap<String, Value> },
    /// Fail with a configured error.
    Raise { error: ErrorTemplate },
    /// Invoke an activity through the activity invoker.
    Call {
        call: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        with: BTreeMap<String, Value>,
    },
    /// Suspend for a fixed duration.
    Wait { wait: WorkflowDuration },
    /// Suspend until correlated events arrive.
    Listen { listen: ListenSpec },
}

impl TaskKind {
    /// Short name of the kind, used in logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Do { .. } => "do",
            TaskKind::Switch { .. } => "switch",
            TaskKind::For(_) => "for",
            TaskKind::Fork { .. } => "fork",
            TaskKind::Try { .. } => "try",
            TaskKind::Set { .. } => "set",
            TaskKind::Raise { .. } => "raise",
            TaskKind::Call { .. } => "call",
            TaskKind::Wait { .. } => "wait",
            TaskKind::Listen { .. } => "listen",
        }
    }
}

/// One arm of a switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(rename = "do", default)]
    pub tasks: Vec<Task>,
}

/// Loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForSpec {
    /// Binding name for the current item.
    #[serde(default = "default_each")]
    pub each: String,
    /// Expression producing the collection.
    #[serde(rename = "in")]
    pub collection: String,
    /// Binding name for the current index.
    #[serde(default = "default_at")]
    pub at: String,
    /// Evaluated before each iteration; iteration stops when false.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,
    /// Output the array of iteration outputs instead of the last one.
    #[serde(default)]
    pub collect: bool,
    #[serde(rename = "do")]
    pub tasks: Vec<Task>,
}

fn default_each() -> String {
    "item".to_string()
}

fn default_at() -> String {
    "index".to_string()
}

// ---------------------------------------------------------------------------
// Error handling configuration
// ---------------------------------------------------------------------------

/// Catch clause of a try task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchSpec {
    /// Attribute filter; omitted fields accept anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    /// Binding name for the caught error (default `error`).
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Handler body; its output becomes the try's output.
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

impl CatchSpec {
    pub fn binding(&self) -> &str {
        self.as_.as_deref().unwrap_or("error")
    }
}

/// `errors.with` filter of a catch clause.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(default)]
    pub with: ErrorAttributes,
}

/// Error attributes that must all match (AND) when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAttributes {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Error raised by a `raise` task. `detail` may be a `${ expr }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorTemplate {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
