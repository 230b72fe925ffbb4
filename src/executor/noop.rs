//! Executor that does nothing.

use async_trait::async_trait;
use serde_json::Value;

use super::{Executor, ExecutorError};
use crate::graph::GraphNode;
use crate::model::JsonMap;

/// Succeeds immediately, reporting the node id it was invoked for. Useful for
/// wiring tests and placeholder nodes.
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(
        &self,
        node: &GraphNode,
        _inputs: &JsonMap,
    ) -> Result<JsonMap, ExecutorError> {
        let mut output = JsonMap::new();
        output.insert("node_id".to_string(), Value::String(node.id.clone()));
        Ok(output)
    }
}
