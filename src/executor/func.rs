//! Executor backed by an in-process function.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Executor, ExecutorError};
use crate::graph::GraphNode;
use crate::model::JsonMap;

type ExecuteFn =
    dyn Fn(&GraphNode, &JsonMap) -> Result<JsonMap, ExecutorError> + Send + Sync + 'static;

/// Wraps a closure as an executor. The primary runtime for in-process steps
/// and the workhorse of the integration tests.
#[derive(Clone)]
pub struct FuncExecutor {
    func: Arc<ExecuteFn>,
}

impl FuncExecutor {
    pub fn new(
        func: impl Fn(&GraphNode, &JsonMap) -> Result<JsonMap, ExecutorError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Executor for FuncExecutor {
    async fn execute(&self, node: &GraphNode, inputs: &JsonMap) -> Result<JsonMap, ExecutorError> {
        (self.func)(node, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn func_executor_passes_inputs_through() {
        let executor = FuncExecutor::new(|_node, inputs| {
            let mut output = JsonMap::new();
            output.insert("echo".to_string(), json!(inputs.len()));
            Ok(output)
        });

        let mut inputs = JsonMap::new();
        inputs.insert("a".to_string(), json!(1));
        inputs.insert("b".to_string(), json!(2));

        let node = GraphNode::synthetic("n", "func", JsonMap::new());
        let output = executor.execute(&node, &inputs).await.unwrap();
        assert_eq!(output["echo"], json!(2));
    }

    #[tokio::test]
    async fn func_executor_propagates_errors() {
        let executor =
            FuncExecutor::new(|_, _| Err(ExecutorError::Permanent("bad schema".into())));
        let node = GraphNode::synthetic("n", "func", JsonMap::new());
        let err = executor.execute(&node, &JsonMap::new()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
