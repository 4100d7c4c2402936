//! Node graph builder and position addressing.
//!
//! Walks a definition's task tree once, assigns every node a deterministic
//! `NodePosition`, and rejects malformed trees with a `ConfigurationError`.
//! The result is an index arena (`petgraph::DiGraph`, parent -> child edges)
//! plus a position index. Parent lookups go through position prefixes, never
//! back pointers.
//!
//! Position scheme (role segments):
//! - root sequence: `/`, children `/do/<name>`
//! - `do` task children: `<pos>/do/<name>`
//! - `switch` case bodies: `<pos>/switch/<case>`, their children `.../do/<name>`
//! - `for` body: `<pos>/for/<name>`
//! - `fork` branches: `<pos>/fork/<branch>`
//! - `try` body / catch body: `<pos>/try/<name>`, `<pos>/catch/<name>`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use waypost_types::correlation::{AttributeMatcher, EventFilter, ListenSpec, UntilCondition};
use waypost_types::definition::{DefinitionRef, Task, TaskKind, WorkflowDefinition};
use waypost_types::duration::WorkflowDuration;
use waypost_types::error::ConfigurationError;
use waypost_types::position::NodePosition;

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// Structural shape of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeShape {
    /// The workflow root.
    Root,
    /// A switch case body.
    Case,
    /// A task of the given kind (`TaskKind::label`).
    Task(&'static str),
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub position: NodePosition,
    pub shape: NodeShape,
}

/// Addressed view of one definition's task tree.
#[derive(Debug)]
pub struct NodeGraph {
    definition: Arc<WorkflowDefinition>,
    graph: DiGraph<GraphNode, ()>,
    index: HashMap<NodePosition, NodeIndex>,
}

impl NodeGraph {
    /// Build and validate the graph of `definition`.
    pub fn build(definition: Arc<WorkflowDefinition>) -> Result<Self, ConfigurationError> {
        let version = &definition.document.version;
        semver::Version::parse(version).map_err(|e| ConfigurationError::InvalidVersion {
            version: version.clone(),
            reason: e.to_string(),
        })?;

        let mut builder = Builder {
            graph: DiGraph::new(),
            index: HashMap::new(),
        };
        let root_pos = NodePosition::root();
        let root = builder.add(root_pos.clone(), NodeShape::Root);
        if let Some(timeout) = &definition.timeout {
            non_zero(&root_pos, timeout)?;
        }
        non_empty(&root_pos, &definition.tasks, "workflow do")?;
        builder.sequence(root, &root_pos, "do", &definition.tasks)?;

        let Builder { graph, index } = builder;
        Ok(Self {
            definition,
            graph,
            index,
        })
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn definition_ref(&self) -> &DefinitionRef {
        &self.definition.document
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, position: &NodePosition) -> bool {
        self.index.contains_key(position)
    }

    pub fn node(&self, position: &NodePosition) -> Option<&GraphNode> {
        self.index.get(position).map(|idx| &self.graph[*idx])
    }

    /// Every node strictly below `position`.
    pub fn descendants(&self, position: &NodePosition) -> Vec<&NodePosition> {
        let Some(start) = self.index.get(position) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, *start);
        let mut out = Vec::new();
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != *start {
                out.push(&self.graph[idx].position);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct Builder {
    graph: DiGraph<GraphNode, ()>,
    index: HashMap<NodePosition, NodeIndex>,
}

impl Builder {
    fn add(&mut self, position: NodePosition, shape: NodeShape) -> NodeIndex {
        let idx = self.graph.add_node(GraphNode {
            position: position.clone(),
            shape,
        });
        self.index.insert(position, idx);
        idx
    }

    fn sequence(
        &mut self,
        parent: NodeIndex,
        parent_pos: &NodePosition,
        role: &str,
        tasks: &[Task],
    ) -> Result<(), ConfigurationError> {
        let mut seen = HashSet::new();
        for task in tasks {
            check_name(parent_pos, &task.name)?;
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigurationError::DuplicateName {
                    parent: parent_pos.clone(),
                    name: task.name.clone(),
                });
            }
            let pos = parent_pos.child(role, &task.name);
            self.task(parent, pos, task)?;
        }
        Ok(())
    }

    fn task(
        &mut self,
        parent: NodeIndex,
        pos: NodePosition,
        task: &Task,
    ) -> Result<(), ConfigurationError> {
        let idx = self.add(pos.clone(), NodeShape::Task(task.kind.label()));
        self.graph.add_edge(parent, idx, ());

        if let Some(timeout) = &task.timeout {
            non_zero(&pos, timeout)?;
        }

        match &task.kind {
            TaskKind::Do { tasks } => {
                non_empty(&pos, tasks, "do")?;
                self.sequence(idx, &pos, "do", tasks)?;
            }
            TaskKind::Switch { cases } => {
                if cases.is_empty() {
                    return Err(ConfigurationError::EmptyBlock {
                        position: pos,
                        what: "switch cases",
                    });
                }
                if cases.iter().filter(|c| c.when.is_none()).count() > 1 {
                    return Err(ConfigurationError::MultipleDefaults { position: pos });
                }
                let mut seen = HashSet::new();
                for case in cases {
                    check_name(&pos, &case.name)?;
                    if !seen.insert(case.name.as_str()) {
                        return Err(ConfigurationError::DuplicateName {
                            parent: pos.clone(),
                            name: case.name.clone(),
                        });
                    }
                    let case_pos = pos.child("switch", &case.name);
                    let case_idx = self.add(case_pos.clone(), NodeShape::Case);
                    self.graph.add_edge(idx, case_idx, ());
                    self.sequence(case_idx, &case_pos, "do", &case.tasks)?;
                }
            }
            TaskKind::For(spec) => {
                non_empty(&pos, &spec.tasks, "for body")?;
                self.sequence(idx, &pos, "for", &spec.tasks)?;
            }
            TaskKind::Fork { branches, .. } => {
                non_empty(&pos, branches, "fork branches")?;
                self.sequence(idx, &pos, "fork", branches)?;
            }
            TaskKind::Try { body, catch } => {
                non_empty(&pos, body, "try body")?;
                self.sequence(idx, &pos, "try", body)?;
                if let Some(retry) = &catch.retry {
                    if let Some(jitter) = &retry.jitter {
                        if jitter.from.total_millis() > jitter.to.total_millis() {
                            return Err(ConfigurationError::Invalid {
                                position: pos,
                                reason: "retry jitter 'from' exceeds 'to'".to_string(),
                            });
                        }
                    }
                    if retry.max_attempts() == Some(0) {
                        return Err(ConfigurationError::Invalid {
                            position: pos,
                            reason: "retry attempt count must be at least 1".to_string(),
                        });
                    }
                }
                if let Some(tasks) = &catch.tasks {
                    self.sequence(idx, &pos, "catch", tasks)?;
                }
            }
            TaskKind::Wait { wait } => non_zero(&pos, wait)?,
            TaskKind::Listen { listen } => check_listen(&pos, listen)?,
            TaskKind::Set { .. } | TaskKind::Raise { .. } | TaskKind::Call { .. } => {}
        }
        Ok(())
    }
}

fn check_name(parent: &NodePosition, name: &str) -> Result<(), ConfigurationError> {
    let reason = if name.is_empty() {
        Some("name must not be empty")
    } else if name.contains('/') {
        Some("name must not contain '/'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigurationError::InvalidName {
            parent: parent.clone(),
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn non_empty<T>(
    position: &NodePosition,
    items: &[T],
    what: &'static str,
) -> Result<(), ConfigurationError> {
    if items.is_empty() {
        return Err(ConfigurationError::EmptyBlock {
            position: position.clone(),
            what,
        });
    }
    Ok(())
}

fn non_zero(position: &NodePosition, duration: &WorkflowDuration) -> Result<(), ConfigurationError> {
    if duration.is_zero() {
        return Err(ConfigurationError::ZeroDuration {
            position: position.clone(),
        });
    }
    Ok(())
}

fn check_listen(position: &NodePosition, listen: &ListenSpec) -> Result<(), ConfigurationError> {
    if listen.to.conditions().is_empty() {
        return Err(ConfigurationError::EmptyBlock {
            position: position.clone(),
            what: "listen conditions",
        });
    }
    for filter in listen.to.conditions() {
        check_filter(position, filter)?;
    }
    if let Some(UntilCondition::Event(filter)) = &listen.until {
        check_filter(position, filter)?;
    }
    if let Some(timeout) = &listen.timeout {
        non_zero(position, timeout)?;
    }
    Ok(())
}

fn check_filter(position: &NodePosition, filter: &EventFilter) -> Result<(), ConfigurationError> {
    for matcher in filter.with.values() {
        if let AttributeMatcher::Regex(pattern) = matcher {
            regex::Regex::new(pattern).map_err(|e| ConfigurationError::InvalidRegex {
                position: position.clone(),
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GraphCache
// ---------------------------------------------------------------------------

/// Memoizes graph builds per definition, failures included.
#[derive(Debug, Default)]
pub struct GraphCache {
    graphs: DashMap<DefinitionRef, Result<Arc<NodeGraph>, ConfigurationError>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached graph for `definition`, building it on first use.
    pub fn get_or_build(
        &self,
        definition: &Arc<WorkflowDefinition>,
    ) -> Result<Arc<NodeGraph>, ConfigurationError> {
        if let Some(hit) = self.graphs.get(&definition.document) {
            return hit.value().clone();
        }
        let built = NodeGraph::build(Arc::clone(definition)).map(Arc::new);
        if let Err(e) = &built {
            tracing::warn!(definition = %definition.document, error = %e, "definition rejected");
        }
        self.graphs
            .entry(definition.document.clone())
            .or_insert(built)
            .value()
            .clone()
    }

    pub fn cached(&self, reference: &DefinitionRef) -> Option<Result<Arc<NodeGraph>, ConfigurationError>> {
        self.graphs.get(reference).map(|hit| hit.value().clone())
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
