//! Postgres-backed store.
//!
//! Each transition is a single `UPDATE`; upserts rely on the unique indexes
//! declared in the migrations. Payload columns are JSONB and carried as
//! `serde_json` values end to end.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    EventStore, ExecutionStore, NewExecution, NewExecutionEvent, NewExecutionNode, NodeStore,
    StoreError, StoreResult, WorkflowRecord, WorkflowStore,
};
use crate::model::{
    Execution, ExecutionEvent, ExecutionId, ExecutionNode, ExecutionStats, ExecutionStatus,
    JsonMap, NodeStatus,
};

/// Store handle backed by a connection pool. Cloning shares the pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row Decoding
// ============================================================================

fn required_map(row: &PgRow, column: &str) -> StoreResult<JsonMap> {
    let value: Value = row.try_get(column)?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Decode(format!(
            "column {column} is not a JSON object: {other}"
        ))),
    }
}

fn optional_map(row: &PgRow, column: &str) -> StoreResult<Option<JsonMap>> {
    let value: Option<Value> = row.try_get(column)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(StoreError::Decode(format!(
            "column {column} is not a JSON object: {other}"
        ))),
    }
}

fn decode_execution(row: &PgRow) -> StoreResult<Execution> {
    let status: String = row.try_get("status")?;
    Ok(Execution {
        id: ExecutionId(row.try_get("id")?),
        project_id: row.try_get("project_id")?,
        workflow_id: row.try_get("workflow_id")?,
        client_request_id: row.try_get("client_request_id")?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown execution status '{status}'")))?,
        inputs: required_map(row, "inputs")?,
        outputs: optional_map(row, "outputs")?,
        error: optional_map(row, "error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_node(row: &PgRow) -> StoreResult<ExecutionNode> {
    let status: String = row.try_get("status")?;
    Ok(ExecutionNode {
        id: row.try_get("id")?,
        execution_id: ExecutionId(row.try_get("execution_id")?),
        node_id: row.try_get("node_id")?,
        executor_type: row.try_get("executor_type")?,
        status: NodeStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown node status '{status}'")))?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        input: required_map(row, "input")?,
        output: optional_map(row, "output")?,
        error: optional_map(row, "error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

fn decode_event(row: &PgRow) -> StoreResult<ExecutionEvent> {
    Ok(ExecutionEvent {
        id: row.try_get("id")?,
        execution_id: ExecutionId(row.try_get("execution_id")?),
        node_id: row.try_get("node_id")?,
        event_type: row.try_get("event_type")?,
        message: row.try_get("message")?,
        payload: required_map(row, "payload")?,
        created_at: row.try_get("created_at")?,
    })
}

const EXECUTION_COLUMNS: &str = "id, project_id, workflow_id, client_request_id, status, \
     inputs, outputs, error, started_at, completed_at, created_at, updated_at";

const NODE_COLUMNS: &str = "id, execution_id, node_id, executor_type, status, attempt, \
     max_attempts, input, output, error, started_at, completed_at, duration_ms";

// ============================================================================
// Executions
// ============================================================================

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn create(&self, params: NewExecution) -> StoreResult<Execution> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO executions (id, project_id, workflow_id, client_request_id, status, inputs)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (project_id, workflow_id, client_request_id) DO NOTHING
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&params.project_id)
        .bind(&params.workflow_id)
        .bind(&params.client_request_id)
        .bind(ExecutionStatus::Pending.as_str())
        .bind(Value::Object(params.inputs.clone()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return decode_execution(&row);
        }

        // Lost the insert race; the existing row wins.
        self.get_by_idempotency_key(
            &params.project_id,
            &params.workflow_id,
            &params.client_request_id,
        )
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "execution {}/{}/{}",
                params.project_id, params.workflow_id, params.client_request_id
            ))
        })
    }

    async fn get(&self, project_id: &str, execution_id: ExecutionId) -> StoreResult<Execution> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE project_id = $1 AND id = $2"
        ))
        .bind(project_id)
        .bind(execution_id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        decode_execution(&row)
    }

    async fn get_by_idempotency_key(
        &self,
        project_id: &str,
        workflow_id: &str,
        client_request_id: &str,
    ) -> StoreResult<Option<Execution>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM executions
            WHERE project_id = $1 AND workflow_id = $2 AND client_request_id = $3
            "#
        ))
        .bind(project_id)
        .bind(workflow_id)
        .bind(client_request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_execution).transpose()
    }

    async fn mark_running(&self, execution_id: ExecutionId) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(execution_id.0)
        .bind(ExecutionStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        execution_id: ExecutionId,
        outputs: JsonMap,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                outputs = $3,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(execution_id.0)
        .bind(ExecutionStatus::Succeeded.as_str())
        .bind(Value::Object(outputs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, execution_id: ExecutionId, error: JsonMap) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                error = $3,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(execution_id.0)
        .bind(ExecutionStatus::Failed.as_str())
        .bind(Value::Object(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        project_id: &str,
        workflow_id: Option<&str>,
    ) -> StoreResult<Vec<Execution>> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {EXECUTION_COLUMNS} FROM executions
                    WHERE project_id = $1 AND workflow_id = $2
                    ORDER BY created_at DESC
                    "#
                ))
                .bind(project_id)
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {EXECUTION_COLUMNS} FROM executions
                    WHERE project_id = $1
                    ORDER BY created_at DESC
                    "#
                ))
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(decode_execution).collect()
    }

    async fn list_running(&self) -> StoreResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status = $1"
        ))
        .bind(ExecutionStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_execution).collect()
    }

    async fn get_stats(&self, project_id: &str) -> StoreResult<ExecutionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'RUNNING') AS running,
                COUNT(*) FILTER (WHERE status = 'SUCCEEDED') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed
            FROM executions
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ExecutionStats {
            total_executions: row.try_get("total")?,
            running_executions: row.try_get("running")?,
            success_count: row.try_get("succeeded")?,
            failed_count: row.try_get("failed")?,
        })
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[async_trait]
impl NodeStore for PostgresStore {
    async fn upsert(&self, params: NewExecutionNode) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_nodes (
                id, execution_id, node_id, executor_type, status,
                attempt, max_attempts, input
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
            ON CONFLICT (execution_id, node_id)
            DO UPDATE SET
                executor_type = EXCLUDED.executor_type,
                max_attempts = EXCLUDED.max_attempts,
                input = EXCLUDED.input
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.execution_id.0)
        .bind(&params.node_id)
        .bind(&params.executor_type)
        .bind(NodeStatus::Pending.as_str())
        .bind(params.max_attempts)
        .bind(Value::Object(params.input))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_running(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        attempt: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE execution_nodes
            SET status = $3, attempt = $4, started_at = now()
            WHERE execution_id = $1 AND node_id = $2
            "#,
        )
        .bind(execution_id.0)
        .bind(node_id)
        .bind(NodeStatus::Running.as_str())
        .bind(attempt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_succeeded(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        output: JsonMap,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE execution_nodes
            SET status = $3,
                output = $4,
                completed_at = now(),
                duration_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::BIGINT
            WHERE execution_id = $1 AND node_id = $2
            "#,
        )
        .bind(execution_id.0)
        .bind(node_id)
        .bind(NodeStatus::Succeeded.as_str())
        .bind(Value::Object(output))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        error: JsonMap,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE execution_nodes
            SET status = $3, error = $4, completed_at = now()
            WHERE execution_id = $1 AND node_id = $2
            "#,
        )
        .bind(execution_id.0)
        .bind(node_id)
        .bind(NodeStatus::Failed.as_str())
        .bind(Value::Object(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_skipped(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        payload: JsonMap,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE execution_nodes
            SET status = $3, output = $4, completed_at = now()
            WHERE execution_id = $1 AND node_id = $2
            "#,
        )
        .bind(execution_id.0)
        .bind(node_id)
        .bind(NodeStatus::Skipped.as_str())
        .bind(Value::Object(payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        execution_id: ExecutionId,
        node_id: &str,
        attempt: i32,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE execution_nodes
            SET status = $3, attempt = $4
            WHERE execution_id = $1 AND node_id = $2
            "#,
        )
        .bind(execution_id.0)
        .bind(node_id)
        .bind(NodeStatus::Retrying.as_str())
        .bind(attempt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> StoreResult<Vec<ExecutionNode>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM execution_nodes
            WHERE execution_id = $1
            ORDER BY node_id
            "#
        ))
        .bind(execution_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_node).collect()
    }

    async fn list_runnable(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionNode>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM execution_nodes
            WHERE execution_id = $1 AND status IN ($2, $3)
            ORDER BY node_id
            "#
        ))
        .bind(execution_id.0)
        .bind(NodeStatus::Pending.as_str())
        .bind(NodeStatus::Retrying.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_node).collect()
    }
}

// ============================================================================
// Events
// ============================================================================

#[async_trait]
impl EventStore for PostgresStore {
    async fn append(&self, event: NewExecutionEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_events (id, execution_id, node_id, event_type, message, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.execution_id.0)
        .bind(&event.node_id)
        .bind(&event.event_type)
        .bind(&event.message)
        .bind(Value::Object(event.payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, execution_id: ExecutionId) -> StoreResult<Vec<ExecutionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, node_id, event_type, message, payload, created_at
            FROM execution_events
            WHERE execution_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(execution_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_event).collect()
    }
}

// ============================================================================
// Workflows
// ============================================================================

#[async_trait]
impl WorkflowStore for PostgresStore {
    async fn put(&self, record: WorkflowRecord) -> StoreResult<()> {
        let definition = serde_json::to_value(&record.definition)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, project_id, name, version, definition)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (project_id, name, version) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.project_id)
        .bind(&record.name)
        .bind(record.version)
        .bind(definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, project_id: &str, name: &str) -> StoreResult<WorkflowRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, version, definition, created_at
            FROM workflows
            WHERE project_id = $1 AND name = $2
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow {project_id}/{name}")))?;

        let definition: Value = row.try_get("definition")?;
        Ok(WorkflowRecord {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            definition: serde_json::from_value(definition)?,
            created_at: row.try_get("created_at")?,
        })
    }
}
