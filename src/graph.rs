//! In-memory DAG built from a workflow definition.
//!
//! Forward `depends` edges are the source of truth; `children` back-edges are
//! derived for observability. Validation rejects cycles and dangling node
//! references, after which the engine assumes DAG shape.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use crate::definition::{InputBinding, WorkflowDefinition};
use crate::model::JsonMap;

/// Errors raised by graph validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected at node '{0}'")]
    Cycle(String),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("node '{node}' references unknown node '{reference}'")]
    UnknownReference { node: String, reference: String },
}

/// Retry policy parsed from a node spec. Only positive limits survive
/// parsing; a missing policy means the engine default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
}

/// Compensation link parsed from a node spec.
#[derive(Debug, Clone)]
pub struct Compensation {
    pub uses: String,
    pub with: JsonMap,
}

/// Comparison half of a parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(Value),
    NotEquals(Value),
}

/// Parsed `when` clause: a post-success predicate on an upstream output key.
#[derive(Debug, Clone)]
pub struct Condition {
    pub from_node: String,
    pub key: String,
    pub predicate: Predicate,
}

impl Condition {
    /// Evaluate the predicate against the referenced output value.
    ///
    /// Both sides are compared through their string forms so that values
    /// parsed from YAML (often strings) match values produced at runtime
    /// (often numbers or booleans). An absent value and an explicit null are
    /// equivalent.
    pub fn evaluate(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match &self.predicate {
            Predicate::Equals(expected) => {
                let expected = Some(expected).filter(|v| !v.is_null());
                match (value, expected) {
                    (None, None) => true,
                    (Some(v), Some(e)) => stringify(v) == stringify(e),
                    _ => false,
                }
            }
            Predicate::NotEquals(expected) => {
                let expected = Some(expected).filter(|v| !v.is_null());
                match (value, expected) {
                    (None, None) => false,
                    (Some(v), Some(e)) => stringify(v) != stringify(e),
                    _ => true,
                }
            }
        }
    }
}

/// String form used for predicate comparison.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One vertex of the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub depends: Vec<String>,
    pub children: Vec<String>,
    pub uses: String,
    pub with: JsonMap,
    pub inputs: BTreeMap<String, InputBinding>,
    pub when: Option<Condition>,
    pub retry: Option<RetryPolicy>,
    pub compensate: Option<Compensation>,
}

impl GraphNode {
    /// Stand-in node handed to an executor when running a compensation hook.
    pub fn synthetic(id: &str, uses: &str, with: JsonMap) -> Self {
        Self {
            id: id.to_string(),
            depends: Vec::new(),
            children: Vec::new(),
            uses: uses.to_string(),
            with,
            inputs: BTreeMap::new(),
            when: None,
            retry: None,
            compensate: None,
        }
    }
}

/// The DAG for one workflow definition.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, GraphNode>,
}

impl Graph {
    /// Build the graph from a definition. Structure is taken as-is; call
    /// [`Graph::validate`] to reject malformed definitions.
    pub fn build(def: &WorkflowDefinition) -> Self {
        let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();

        for (id, spec) in &def.nodes {
            let when = spec.when.as_ref().and_then(|w| {
                let predicate = match (&w.equals, &w.not_equals) {
                    (Some(v), _) => Predicate::Equals(v.clone()),
                    (None, Some(v)) => Predicate::NotEquals(v.clone()),
                    (None, None) => return None,
                };
                Some(Condition {
                    from_node: w.from_node.clone(),
                    key: w.key.clone(),
                    predicate,
                })
            });

            let retry = spec
                .retry
                .as_ref()
                .filter(|r| r.max_attempts > 0)
                .map(|r| RetryPolicy {
                    max_attempts: r.max_attempts as i32,
                });

            let compensate = spec.compensate.as_ref().map(|c| Compensation {
                uses: c.uses.clone(),
                with: c.with.clone(),
            });

            nodes.insert(
                id.clone(),
                GraphNode {
                    id: id.clone(),
                    depends: spec.depends_on.clone(),
                    children: Vec::new(),
                    uses: spec.uses.clone(),
                    with: spec.with.clone(),
                    inputs: spec.inputs.clone(),
                    when,
                    retry,
                    compensate,
                },
            );
        }

        let edges: Vec<(String, String)> = nodes
            .values()
            .flat_map(|n| n.depends.iter().map(|d| (d.clone(), n.id.clone())))
            .collect();
        for (parent, child) in edges {
            if let Some(node) = nodes.get_mut(&parent) {
                node.children.push(child);
            }
        }

        Self { nodes }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Reject cycles and references to nodes that do not exist.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            for dep in &node.depends {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if let Some(cond) = &node.when {
                if !self.nodes.contains_key(&cond.from_node) {
                    return Err(GraphError::UnknownReference {
                        node: node.id.clone(),
                        reference: cond.from_node.clone(),
                    });
                }
            }
            for binding in node.inputs.values() {
                if let InputBinding::Reference { from_node, .. } = binding {
                    if !self.nodes.contains_key(from_node) {
                        return Err(GraphError::UnknownReference {
                            node: node.id.clone(),
                            reference: from_node.clone(),
                        });
                    }
                }
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: HashSet<&str> = HashSet::new();
        for id in self.nodes.keys() {
            self.visit(id, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Result<(), GraphError> {
        if stack.contains(id) {
            return Err(GraphError::Cycle(id.to_string()));
        }
        if visited.contains(id) {
            return Ok(());
        }
        visited.insert(id);
        stack.insert(id);
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.depends {
                self.visit(dep, visited, stack)?;
            }
        }
        stack.remove(id);
        Ok(())
    }

    /// Topological order: every node appears after all of its dependencies.
    pub fn plan(&self) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut order: Vec<String> = Vec::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            self.plan_visit(id, &mut visited, &mut order);
        }
        order
    }

    fn plan_visit<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(id) {
            return;
        }
        visited.insert(id);
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.depends {
                self.plan_visit(dep, visited, order);
            }
        }
        order.push(id.to_string());
    }

    /// Nodes whose dependency set is fully contained in `completed`.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<&GraphNode> {
        self.nodes
            .values()
            .filter(|n| !completed.contains(&n.id))
            .filter(|n| n.depends.iter().all(|d| completed.contains(d)))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
