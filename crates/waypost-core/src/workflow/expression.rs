//! Expression evaluation port and its JEXL implementation.
//!
//! Guards, transforms, correlation keys and retry conditions are all
//! evaluated through `ExpressionEvaluator`. The engine only ever passes data
//! as the evaluation environment, never by interpolating it into expression
//! strings.
//!
//! Expressions may be written bare (`input.total > 10`) or wrapped as a
//! runtime expression (`${ input.total > 10 }`); the wrapper is stripped
//! before evaluation.

use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid evaluation environment: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Evaluates expressions against a JSON environment object.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, env: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate and coerce the result with JavaScript-like truthiness.
    fn evaluate_bool(&self, expression: &str, env: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, env).map(|v| value_to_bool(&v))
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Strip a `${ ... }` wrapper, if present.
pub fn strip_runtime_expression(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// `true` when the string is a `${ ... }` runtime expression.
pub fn is_runtime_expression(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.starts_with("${") && trimmed.ends_with('}')
}

/// Recursively evaluate every `${ ... }` string inside `value`.
///
/// Other strings, numbers and structure are copied unchanged.
pub fn resolve_templates(
    evaluator: &dyn ExpressionEvaluator,
    value: &Value,
    env: &Value,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) if is_runtime_expression(s) => {
            evaluator.evaluate(strip_runtime_expression(s), env)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_templates(evaluator, item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, field) in fields {
                out.insert(key.clone(), resolve_templates(evaluator, field, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::String(subject)) => {
                        let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                        subject.contains(search)
                    }
                    Some(Value::Array(items)) => {
                        let needle = args.get(1).cloned().unwrap_or(Value::Null);
                        items.contains(&needle)
                    }
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("matches", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let pattern = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                let matched = regex::Regex::new(pattern)
                    .map(|re| re.is_match(subject))
                    .unwrap_or(false);
                Ok(json!(matched))
            })
            // Works on strings, arrays, and objects
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            });

        Self { evaluator }
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JexlEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JexlEvaluator").finish_non_exhaustive()
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, env: &Value) -> Result<Value, ExpressionError> {
        if !env.is_object() {
            return Err(ExpressionError::InvalidContext(
                "environment must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(strip_runtime_expression(expression), env)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
