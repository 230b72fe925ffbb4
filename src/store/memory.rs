//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    EventStore, ExecutionStore, NewExecution, NewExecutionEvent, NewExecutionNode, NodeStore,
    StoreError, StoreResult, WorkflowRecord, WorkflowStore,
};
use crate::model::{
    Execution, ExecutionEvent, ExecutionId, ExecutionNode, ExecutionStats, ExecutionStatus,
    JsonMap, NodeStatus,
};

/// Store keeping every record behind a mutex. Implements all four store
/// capabilities so one instance can back a whole engine.
#[derive(Clone, Default)]
pub struct MemoryStore {
    executions: Arc<Mutex<HashMap<ExecutionId, Execution>>>,
    nodes: Arc<Mutex<HashMap<(ExecutionId, String), ExecutionNode>>>,
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
    workflows: Arc<Mutex<Vec<WorkflowRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, params: NewExecution) -> StoreResult<Execution> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        if let Some(existing) = executions.values().find(|e| {
            e.project_id == params.project_id
                && e.workflow_id == params.workflow_id
                && e.client_request_id == params.client_request_id
        }) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let execution = Execution {
            id: ExecutionId::new(),
            project_id: params.project_id,
            workflow_id: params.workflow_id,
            client_request_id: params.client_request_id,
            status: ExecutionStatus::Pending,
            inputs: params.inputs,
            outputs: None,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get(&self, project_id: &str, execution_id: ExecutionId) -> StoreResult<Execution> {
        let executions = self.executions.lock().expect("executions poisoned");
        executions
            .get(&execution_id)
            .filter(|e| e.project_id == project_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))
    }

    async fn get_by_idempotency_key(
        &self,
        project_id: &str,
        workflow_id: &str,
        client_request_id: &str,
    ) -> StoreResult<Option<Execution>> {
        let executions = self.executions.lock().expect("executions poisoned");
        Ok(executions
            .values()
            .find(|e| {
                e.project_id == project_id
                    && e.workflow_id == workflow_id
                    && e.client_request_id == client_request_id
            })
            .cloned())
    }

    async fn mark_running(&self, execution_id: ExecutionId) -> StoreResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let execution = executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        let now = Utc::now();
        execution.status = ExecutionStatus::Running;
        execution.started_at.get_or_insert(now);
        execution.updated_at = now;
        Ok(())
    }

    async fn mark_completed(
        &self,
        execution_id: ExecutionId,
        outputs: JsonMap,
    ) -> StoreResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let execution = executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        let now = Utc::now();
        execution.status = ExecutionStatus::Succeeded;
        execution.outputs = Some(outputs);
        execution.completed_at = Some(now);
        execution.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, execution_id: ExecutionId, error: JsonMap) -> StoreResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        let execution = executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        let now = Utc::now();
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(error);
        execution.completed_at = Some(now);
        execution.updated_at = now;
        Ok(())
    }

    async fn list(
        &self,
        project_id: &str,
        workflow_id: Option<&str>,
    ) -> StoreResult<Vec<Execution>> {
        let executions = self.executions.lock().expect("executions poisoned");
        let mut list: Vec<Execution> = executions
            .values()
            .filter(|e| e.project_id == project_id)
            .filter(|e| workflow_id.is_none_or(|w| e.workflow_id == w))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn list_running(&self) -> StoreResult<Vec<Execution>> {
        let executions = self.executions.lock().expect("executions poisoned");
        Ok(executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }

    async fn get_stats(&self, project_id: &str) -> StoreResult<ExecutionStats> {
        let executions = self.executions.lock().expect("executions poisoned");
        let mut stats = ExecutionStats::default();
        for execution in executions.values().filter(|e| e.project_id == project_id) {
            stats.total_executions += 1;
            match execution.status {
                ExecutionStatus::Running => stats.running_executions += 1,
                ExecutionStatus::Succeeded => stats.success_count += 1,
                ExecutionStatus::Failed => stats.failed_count += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn upsert(&self, params: NewExecutionNode) -> StoreResult<()> {
        let mut nodes = self.nodes.lock().expect("nodes poisoned");
        let key = (params.execution_id, params.node_id.clone());
        match nodes.get_mut(&key) {
            Some(existing) => {
                existing.executor_type = params.executor_type;
                existing.max_attempts = params.max_attempts;
                existing.input = params.input;
            }
            None => {
                nodes.insert(
                    key,
                    ExecutionNode {
                        id: Uuid::new_v4(),
                        execution_id: params.execution_id,
                        node_id: params.node_id,
                        executor_type: params.executor_type,
                        status: NodeStatus::Pending,
                        attempt: 0,
                        max_attempts: params.max_attempts,
                        input: params.input,
                        output: None,
                        error: None,
                        started_at: None,
                        completed_at: None,
                        duration_ms: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn mark_running(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        attempt: i32,
    ) -> StoreResult<()> {
        self.update_node(execution_id, node_id, |node| {
            node.status = NodeStatus::Running;
            node.attempt = attempt;
            node.started_at = Some(Utc::now());
        })
    }

    async fn mark_succeeded(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        output: JsonMap,
    ) -> StoreResult<()> {
        self.update_node(execution_id, node_id, |node| {
            let now = Utc::now();
            node.status = NodeStatus::Succeeded;
            node.output = Some(output);
            node.completed_at = Some(now);
            node.duration_ms = node
                .started_at
                .map(|started| (now - started).num_milliseconds());
        })
    }

    async fn mark_failed(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        error: JsonMap,
    ) -> StoreResult<()> {
        self.update_node(execution_id, node_id, |node| {
            node.status = NodeStatus::Failed;
            node.error = Some(error);
            node.completed_at = Some(Utc::now());
        })
    }

    async fn mark_skipped(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        payload: JsonMap,
    ) -> StoreResult<()> {
        self.update_node(execution_id, node_id, |node| {
            node.status = NodeStatus::Skipped;
            node.output = Some(payload);
            node.completed_at = Some(Utc::now());
        })
    }

    async fn mark_retrying(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        attempt: i32,
    ) -> StoreResult<()> {
        self.update_node(execution_id, node_id, |node| {
            node.status = NodeStatus::Retrying;
            node.attempt = attempt;
        })
    }

    async fn list_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> StoreResult<Vec<ExecutionNode>> {
        let nodes = self.nodes.lock().expect("nodes poisoned");
        let mut list: Vec<ExecutionNode> = nodes
            .values()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(list)
    }

    async fn list_runnable(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionNode>> {
        let list = self.list_by_execution(execution_id).await?;
        Ok(list.into_iter().filter(|n| n.status.is_runnable()).collect())
    }
}

impl MemoryStore {
    fn update_node(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        apply: impl FnOnce(&mut ExecutionNode),
    ) -> StoreResult<()> {
        let mut nodes = self.nodes.lock().expect("nodes poisoned");
        let node = nodes
            .get_mut(&(execution_id, node_id.to_string()))
            .ok_or_else(|| {
                StoreError::NotFound(format!("node {node_id} of execution {execution_id}"))
            })?;
        apply(node);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: NewExecutionEvent) -> StoreResult<()> {
        let mut events = self.events.lock().expect("events poisoned");
        events.push(ExecutionEvent {
            id: Uuid::new_v4(),
            execution_id: event.execution_id,
            node_id: event.node_id,
            event_type: event.event_type,
            message: event.message,
            payload: event.payload,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionEvent>> {
        let events = self.events.lock().expect("events poisoned");
        Ok(events
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn put(&self, record: WorkflowRecord) -> StoreResult<()> {
        let mut workflows = self.workflows.lock().expect("workflows poisoned");
        let exists = workflows.iter().any(|w| {
            w.project_id == record.project_id
                && w.name == record.name
                && w.version == record.version
        });
        if !exists {
            workflows.push(record);
        }
        Ok(())
    }

    async fn get(&self, project_id: &str, name: &str) -> StoreResult<WorkflowRecord> {
        let workflows = self.workflows.lock().expect("workflows poisoned");
        workflows
            .iter()
            .filter(|w| w.project_id == project_id && w.name == name)
            .max_by_key(|w| w.version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow {project_id}/{name}")))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn new_execution(request_id: &str) -> NewExecution {
        NewExecution {
            project_id: "proj".into(),
            workflow_id: "wf".into(),
            client_request_id: request_id.into(),
            inputs: JsonMap::new(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_on_request_id() {
        let store = MemoryStore::new();
        let executions: &dyn ExecutionStore = &store;
        let first = executions.create(new_execution("r1")).await.unwrap();
        let second = executions.create(new_execution("r1")).await.unwrap();
        assert_eq!(first.id, second.id);

        let third = executions.create(new_execution("r2")).await.unwrap();
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn upsert_preserves_status_and_attempt() {
        let store = MemoryStore::new();
        let executions: &dyn ExecutionStore = &store;
        let nodes: &dyn NodeStore = &store;
        let execution = executions.create(new_execution("r1")).await.unwrap();
        let params = NewExecutionNode {
            execution_id: execution.id,
            node_id: "a".into(),
            executor_type: "noop".into(),
            input: JsonMap::new(),
            max_attempts: 3,
        };
        nodes.upsert(params.clone()).await.unwrap();
        nodes.mark_running(execution.id, "a", 1).await.unwrap();

        nodes.upsert(params).await.unwrap();
        let rows = nodes.list_by_execution(execution.id).await.unwrap();
        assert_eq!(rows[0].status, NodeStatus::Running);
        assert_eq!(rows[0].attempt, 1);
    }

    #[tokio::test]
    async fn succeeded_node_records_duration() {
        let store = MemoryStore::new();
        let executions: &dyn ExecutionStore = &store;
        let nodes: &dyn NodeStore = &store;
        let execution = executions.create(new_execution("r1")).await.unwrap();
        nodes
            .upsert(NewExecutionNode {
                execution_id: execution.id,
                node_id: "a".into(),
                executor_type: "noop".into(),
                input: JsonMap::new(),
                max_attempts: 3,
            })
            .await
            .unwrap();
        nodes.mark_running(execution.id, "a", 1).await.unwrap();
        nodes
            .mark_succeeded(execution.id, "a", JsonMap::new())
            .await
            .unwrap();

        let rows = nodes.list_by_execution(execution.id).await.unwrap();
        assert_eq!(rows[0].status, NodeStatus::Succeeded);
        assert!(rows[0].duration_ms.is_some());
        assert!(rows[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let store = MemoryStore::new();
        let executions: &dyn ExecutionStore = &store;
        let a = executions.create(new_execution("r1")).await.unwrap();
        let b = executions.create(new_execution("r2")).await.unwrap();
        let c = executions.create(new_execution("r3")).await.unwrap();
        executions.mark_running(a.id).await.unwrap();
        executions.mark_completed(b.id, JsonMap::new()).await.unwrap();
        executions.mark_failed(c.id, JsonMap::new()).await.unwrap();

        let stats = executions.get_stats("proj").await.unwrap();
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.running_executions, 1);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failed_count, 1);
    }

    #[tokio::test]
    async fn workflow_get_returns_latest_version() {
        let store = MemoryStore::new();
        let workflows: &dyn WorkflowStore = &store;
        for version in [1, 3, 2] {
            workflows
                .put(WorkflowRecord {
                    id: Uuid::new_v4(),
                    project_id: "proj".into(),
                    name: "wf".into(),
                    version,
                    definition: Default::default(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let record = workflows.get("proj", "wf").await.unwrap();
        assert_eq!(record.version, 3);
    }
}
