//! Executor capability and the runtime registry.
//!
//! An executor invokes one node attempt for a runtime kind. The registry is
//! populated at startup and read-only afterwards; the engine looks executors
//! up by the runtime name carried on a resolved module.

mod func;
mod noop;

pub use func::FuncExecutor;
pub use noop::NoopExecutor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::graph::GraphNode;
use crate::model::JsonMap;

/// Failure of one executor invocation.
///
/// `Transient` failures (network, 5xx, timeouts) are retried up to the node's
/// attempt limit; `Permanent` failures (4xx, schema violations) fail the node
/// immediately. Executors that cannot classify a failure should report it as
/// transient.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Capability to run one node attempt.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, node: &GraphNode, inputs: &JsonMap) -> Result<JsonMap, ExecutorError>;
}

/// Mapping from runtime name to executor, built once at startup.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runtime: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(runtime.into(), executor);
    }

    pub fn get(&self, runtime: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(runtime).cloned()
    }

    pub fn runtimes(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register("noop", Arc::new(NoopExecutor));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("http").is_none());
        assert_eq!(registry.runtimes(), vec!["noop"]);
    }

    #[test]
    fn error_classification() {
        assert!(ExecutorError::Transient("503".into()).is_retryable());
        assert!(!ExecutorError::Permanent("400".into()).is_retryable());
    }

    #[tokio::test]
    async fn noop_reports_node_id() {
        let node = GraphNode::synthetic("step-1", "noop", JsonMap::new());
        let output = NoopExecutor.execute(&node, &JsonMap::new()).await.unwrap();
        assert_eq!(output["node_id"], "step-1");
    }
}
