//! Workflow definition model and YAML parsing.
//!
//! A definition is an immutable mapping from node id to node spec. Parsing
//! validates structure up front (non-empty, acyclic, all references resolve)
//! so the engine can assume a well-formed DAG at execution time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::{Graph, GraphError};
use crate::model::JsonMap;

/// Errors raised while parsing or validating a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("workflow must contain at least one node")]
    Empty,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Immutable workflow definition: node id to node spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: BTreeMap<String, NodeSpec>,
}

/// Definition of a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Symbolic module reference, optionally `name@version`.
    pub uses: String,

    /// Node ids this node waits for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Static input defaults.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub with: JsonMap,

    /// Dynamic input bindings: literals or references to upstream outputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputBinding>,

    /// Predicate on an upstream output deciding whether this node runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<CompensateSpec>,
}

/// A dynamic input value: either a reference to another node's output key or
/// a literal. Reference shape is tried first, so a mapping carrying
/// `from_node` and `key` is always treated as a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    Reference { from_node: String, key: String },
    Literal(Value),
}

/// Conditional execution clause. Exactly one comparison is evaluated; when
/// both are present, `equals` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhenSpec {
    pub from_node: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equals: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: i64,
}

/// Reference to a compensating module invoked if the execution fails after
/// this node succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensateSpec {
    pub uses: String,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub with: JsonMap,
}

/// Parse a YAML document into a validated [`WorkflowDefinition`].
pub fn parse_definition(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a definition back to YAML.
pub fn serialize_definition(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Validate a definition: non-empty, acyclic, and every node reference in
/// `depends_on`, `when.from_node`, and `inputs[*].from_node` resolves.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.nodes.is_empty() {
        return Err(DefinitionError::Empty);
    }
    Graph::build(def).validate()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
