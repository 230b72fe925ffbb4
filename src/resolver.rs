//! Effective input computation for a node about to run.
//!
//! The base mapping was materialized when the node row was ensured (static
//! `with` defaults overridden by workflow-level inputs). On top of that, the
//! node's declared input bindings are applied: literals as-is, references by
//! looking the value up in the referenced node's output. Binding keys win
//! over base keys.

use std::collections::HashMap;

use thiserror::Error;

use crate::definition::InputBinding;
use crate::model::JsonMap;

/// Input resolution failures. Both are permanent: a missing upstream output
/// cannot appear for a node whose dependencies already succeeded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("output of node '{from_node}' not available for input '{input}'")]
    MissingNode { input: String, from_node: String },

    #[error("key '{key}' not found in output of node '{from_node}' for input '{input}'")]
    MissingKey {
        input: String,
        from_node: String,
        key: String,
    },
}

/// Strip the `{"output": ...}` envelope written on node success. Outputs are
/// wrapped on write and unwrapped here on every read.
pub fn unwrap_output(output: &JsonMap) -> &JsonMap {
    match output.get("output") {
        Some(serde_json::Value::Object(inner)) => inner,
        _ => output,
    }
}

/// Compute the effective inputs for a node.
///
/// `outputs` maps succeeded node ids to their unwrapped outputs.
pub fn resolve_inputs<'a, B>(
    base: &JsonMap,
    bindings: B,
    outputs: &HashMap<String, &JsonMap>,
) -> Result<JsonMap, ResolveError>
where
    B: IntoIterator<Item = (&'a String, &'a InputBinding)>,
{
    let mut resolved = base.clone();

    for (input, binding) in bindings {
        match binding {
            InputBinding::Literal(value) => {
                resolved.insert(input.clone(), value.clone());
            }
            InputBinding::Reference { from_node, key } => {
                let output = outputs.get(from_node.as_str()).ok_or_else(|| {
                    ResolveError::MissingNode {
                        input: input.clone(),
                        from_node: from_node.clone(),
                    }
                })?;
                let value = output.get(key).ok_or_else(|| ResolveError::MissingKey {
                    input: input.clone(),
                    from_node: from_node.clone(),
                    key: key.clone(),
                })?;
                resolved.insert(input.clone(), value.clone());
            }
        }
    }

    Ok(resolved)
}

// ============================================================================
// Tests
// ============================================================================
