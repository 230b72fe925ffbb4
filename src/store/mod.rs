//! Persistence capabilities for executions, nodes, events, and workflow
//! definitions.
//!
//! Each concern is one narrow trait so the engine can run against the
//! in-memory store in tests and the Postgres store in production. Every state
//! transition is a single write; the engine re-lists rows on each
//! reconciliation pass instead of trusting cached state.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::definition::WorkflowDefinition;
use crate::model::{
    Execution, ExecutionEvent, ExecutionId, ExecutionNode, ExecutionStats, JsonMap,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Creation Parameters
// ============================================================================

/// Parameters for creating an execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub project_id: String,
    pub workflow_id: String,
    pub client_request_id: String,
    pub inputs: JsonMap,
}

/// Parameters for ensuring a node row exists.
#[derive(Debug, Clone)]
pub struct NewExecutionNode {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub executor_type: String,
    pub input: JsonMap,
    pub max_attempts: i32,
}

/// Parameters for appending an audit event.
#[derive(Debug, Clone)]
pub struct NewExecutionEvent {
    pub execution_id: ExecutionId,
    pub node_id: Option<String>,
    pub event_type: String,
    pub message: String,
    pub payload: JsonMap,
}

/// A registered workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub project_id: String,
    pub name: String,
    pub version: i32,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Capabilities
// ============================================================================

/// Store capability for execution rows.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an execution, idempotent on
    /// `(project_id, workflow_id, client_request_id)`. A conflicting create
    /// returns the existing row unchanged.
    async fn create(&self, params: NewExecution) -> StoreResult<Execution>;

    async fn get(&self, project_id: &str, execution_id: ExecutionId) -> StoreResult<Execution>;

    async fn get_by_idempotency_key(
        &self,
        project_id: &str,
        workflow_id: &str,
        client_request_id: &str,
    ) -> StoreResult<Option<Execution>>;

    async fn mark_running(&self, execution_id: ExecutionId) -> StoreResult<()>;

    async fn mark_completed(&self, execution_id: ExecutionId, outputs: JsonMap)
    -> StoreResult<()>;

    async fn mark_failed(&self, execution_id: ExecutionId, error: JsonMap) -> StoreResult<()>;

    /// Executions for a project, optionally narrowed to one workflow, newest
    /// first.
    async fn list(&self, project_id: &str, workflow_id: Option<&str>)
    -> StoreResult<Vec<Execution>>;

    async fn list_running(&self) -> StoreResult<Vec<Execution>>;

    async fn get_stats(&self, project_id: &str) -> StoreResult<ExecutionStats>;
}

/// Store capability for execution node rows.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Ensure the row exists, idempotent on `(execution_id, node_id)`.
    /// Re-ensuring refreshes the materialized input and limits but preserves
    /// status and attempt.
    async fn upsert(&self, params: NewExecutionNode) -> StoreResult<()>;

    /// Record dispatch of the given attempt.
    async fn mark_running(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        attempt: i32,
    ) -> StoreResult<()>;

    async fn mark_succeeded(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        output: JsonMap,
    ) -> StoreResult<()>;

    async fn mark_failed(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        error: JsonMap,
    ) -> StoreResult<()>;

    async fn mark_skipped(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        payload: JsonMap,
    ) -> StoreResult<()>;

    /// Record a failed attempt that will be retried.
    async fn mark_retrying(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        attempt: i32,
    ) -> StoreResult<()>;

    async fn list_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> StoreResult<Vec<ExecutionNode>>;

    /// Rows in `PENDING` or `RETRYING`.
    async fn list_runnable(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionNode>>;
}

/// Store capability for the append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: NewExecutionEvent) -> StoreResult<()>;

    /// Events for one execution in `created_at` ascending order.
    async fn list(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionEvent>>;
}

/// Store capability for registered workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Register a definition. Definitions are immutable; re-registering an
    /// existing `(project, name, version)` is a no-op.
    async fn put(&self, record: WorkflowRecord) -> StoreResult<()>;

    /// Latest registered version of a workflow.
    async fn get(&self, project_id: &str, name: &str) -> StoreResult<WorkflowRecord>;
}
