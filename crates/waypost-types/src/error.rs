//! Error types shared across the engine.
//!
//! `WorkflowError` is the runtime error value that flows through try/catch
//! scopes. `ConfigurationError` is the build-time error for malformed
//! definitions and is never caught or retried. `RepositoryError` is returned
//! by storage ports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::NodePosition;

/// Base URI for the standard error types.
pub const ERROR_TYPE_BASE: &str = "https://serverlessworkflow.io/spec/1.0.0/errors";

/// Classification of runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Expression,
    Communication,
    Timeout,
    Authentication,
    Authorization,
    Runtime,
}

impl ErrorKind {
    /// URI used as the `type` of errors of this kind.
    pub fn type_uri(&self) -> String {
        format!("{ERROR_TYPE_BASE}/{}", self.as_str())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Expression => "expression",
            ErrorKind::Communication => "communication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Runtime => "runtime",
        }
    }

    /// Default status code for the kind.
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorKind::Configuration | ErrorKind::Validation | ErrorKind::Expression => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Timeout => 408,
            ErrorKind::Communication | ErrorKind::Runtime => 500,
        }
    }

    fn from_type_uri(uri: &str) -> Option<Self> {
        let tail = uri.strip_prefix(ERROR_TYPE_BASE)?.strip_prefix('/')?;
        match tail {
            "configuration" => Some(ErrorKind::Configuration),
            "validation" => Some(ErrorKind::Validation),
            "expression" => Some(ErrorKind::Expression),
            "communication" => Some(ErrorKind::Communication),
            "timeout" => Some(ErrorKind::Timeout),
            "authentication" => Some(ErrorKind::Authentication),
            "authorization" => Some(ErrorKind::Authorization),
            "runtime" => Some(ErrorKind::Runtime),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Structured runtime error raised by a node.
///
/// Immutable once raised; `instance` records the position that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{title} [{error_type}] (status {status})")]
pub struct WorkflowError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub status: u16,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<NodePosition>,
}

impl WorkflowError {
    /// Create an error of a standard kind with its default status.
    pub fn new(kind: ErrorKind, title: impl Into<String>) -> Self {
        Self {
            error_type: kind.type_uri(),
            status: kind.default_status(),
            title: title.into(),
            detail: None,
            instance: None,
        }
    }

    pub fn validation(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, title)
    }

    pub fn expression(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, title)
    }

    pub fn communication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Communication, title)
    }

    pub fn timeout(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, title)
    }

    pub fn authentication(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, title)
    }

    pub fn authorization(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, title)
    }

    pub fn runtime(title: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, title)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Record the raising position unless one is already present.
    pub fn at(mut self, position: &NodePosition) -> Self {
        if self.instance.is_none() {
            self.instance = Some(position.clone());
        }
        self
    }

    /// Standard kind of this error, if its type is one of the standard URIs.
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_type_uri(&self.error_type)
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }
}

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

/// A definition that cannot be turned into a node graph.
///
/// Cached alongside successful graphs so every start of a broken definition
/// fails identically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("duplicate task name '{name}' under {parent}")]
    DuplicateName { parent: NodePosition, name: String },

    #[error("invalid task name '{name}' under {parent}: {reason}")]
    InvalidName {
        parent: NodePosition,
        name: String,
        reason: String,
    },

    #[error("{position}: {what} must not be empty")]
    EmptyBlock {
        position: NodePosition,
        what: &'static str,
    },

    #[error("{position}: switch declares more than one default case")]
    MultipleDefaults { position: NodePosition },

    #[error("{position}: invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        position: NodePosition,
        pattern: String,
        reason: String,
    },

    #[error("{position}: duration must be greater than zero")]
    ZeroDuration { position: NodePosition },

    #[error("invalid definition version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("{position}: {reason}")]
    Invalid {
        position: NodePosition,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// RepositoryError
// ---------------------------------------------------------------------------

/// Errors from repository operations (used by trait definitions in waypost-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_kind_round_trips_through_uri() {
        let err = WorkflowError::timeout("step took too long");
        assert_eq!(err.error_type, format!("{ERROR_TYPE_BASE}/timeout"));
        assert_eq!(err.status, 408);
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn custom_type_has_no_kind() {
        let err = WorkflowError {
            error_type: "https://example.com/errors/out-of-stock".to_string(),
            status: 409,
            title: "Out of stock".to_string(),
            detail: None,
            instance: None,
        };
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn at_keeps_first_position() {
        let first = NodePosition::root().child("do", "a");
        let second = NodePosition::root().child("do", "b");
        let err = WorkflowError::runtime("boom").at(&first).at(&second);
        assert_eq!(err.instance, Some(first));
    }

    #[test]
    fn workflow_error_serializes_type_field() {
        let err = WorkflowError::communication("503").with_status(503);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], format!("{ERROR_TYPE_BASE}/communication"));
        assert_eq!(json["status"], 503);
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn configuration_error_display_names_position() {
        let err = ConfigurationError::DuplicateName {
            parent: NodePosition::root(),
            name: "fetch".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate task name 'fetch' under /");
    }
}
