//! Hierarchical node addressing.
//!
//! A `NodePosition` is a path of `(role, name)` segments from the root of a
//! workflow's task tree, rendered as `/do/fetch/try/call`. Positions are
//! assigned deterministically by the graph builder and are the primary key
//! for persisted node state and wait registrations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One step down the task tree: the role the child plays inside its parent
/// (`do`, `try`, `catch`, `for`, `fork`, `switch`) and the child's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    pub role: String,
    pub name: String,
}

/// Deterministic, hierarchical address of a node in a workflow graph.
///
/// Invariants: siblings never share a position, and a child's position is
/// always prefixed by its parent's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePosition {
    segments: Vec<Segment>,
}

impl NodePosition {
    /// The root position (`/`).
    pub fn root() -> Self {
        Self::default()
    }

    /// Position of a child reached through `role` under this node.
    pub fn child(&self, role: &str, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment {
            role: role.to_string(),
            name: name.to_string(),
        });
        Self { segments }
    }

    /// Parent position, derived by dropping the last segment.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Strict ancestors, nearest first (the root last).
    pub fn ancestors(&self) -> impl Iterator<Item = NodePosition> + '_ {
        (0..self.segments.len()).rev().map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments below the root.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The last segment, if any.
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Name of the node at this position (empty for the root).
    pub fn name(&self) -> &str {
        self.segments.last().map(|s| s.name.as_str()).unwrap_or("")
    }

    /// `true` when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &NodePosition) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// `true` when `self` equals `other` or lies beneath it.
    pub fn is_within(&self, other: &NodePosition) -> bool {
        self == other || other.is_ancestor_of(self)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl fmt::Display for NodePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}/{}", segment.role, segment.name)?;
        }
        Ok(())
    }
}

/// Error returned when a string is not a well-formed position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node position '{0}'")]
pub struct InvalidPosition(pub String);

impl FromStr for NodePosition {
    type Err = InvalidPosition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix('/') else {
            return Err(InvalidPosition(s.to_string()));
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() % 2 != 0 || parts.iter().any(|p| p.is_empty()) {
            return Err(InvalidPosition(s.to_string()));
        }

        let segments = parts
            .chunks(2)
            .map(|pair| Segment {
                role: pair[0].to_string(),
                name: pair[1].to_string(),
            })
            .collect();
        Ok(Self { segments })
    }
}

impl Serialize for NodePosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodePosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_renders_as_slash() {
        assert_eq!(NodePosition::root().to_string(), "/");
        assert!(NodePosition::root().parent().is_none());
    }

    #[test]
    fn child_is_prefixed_by_parent() {
        let parent = NodePosition::root().child("do", "fetch");
        let child = parent.child("try", "call");
        assert_eq!(child.to_string(), "/do/fetch/try/call");
        assert!(parent.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&parent));
        assert_eq!(child.parent(), Some(parent));
    }

    #[test]
    fn siblings_are_not_ancestors() {
        let a = NodePosition::root().child("do", "a");
        let b = NodePosition::root().child("do", "b");
        assert!(!a.is_ancestor_of(&b));
        assert!(!a.is_within(&b));
        assert!(a.is_within(&a));
    }

    #[test]
    fn ancestors_nearest_first() {
        let pos: NodePosition = "/do/a/fork/b/do/c".parse().unwrap();
        let ancestors: Vec<String> = pos.ancestors().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["/do/a/fork/b", "/do/a", "/"]);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("do/a".parse::<NodePosition>().is_err());
        assert!("/do".parse::<NodePosition>().is_err());
        assert!("/do//x".parse::<NodePosition>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let pos = NodePosition::root().child("do", "wait");
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, "\"/do/wait\"");
        let back: NodePosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }
}
