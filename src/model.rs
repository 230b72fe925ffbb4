//! Runtime records for workflow executions.
//!
//! An [`Execution`] is one run of a workflow, an [`ExecutionNode`] is the
//! attempt record for one graph node within that run, and an
//! [`ExecutionEvent`] is an append-only audit entry. These structs mirror the
//! persistence schema one to one; the stores in [`crate::store`] read and
//! write them without any intermediate row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dynamic `string -> any` payload carried by inputs, outputs, and errors.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Status of a workflow execution.
///
/// `Cancelled` is set externally, never by the engine. `Paused` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "PAUSED" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "RETRYING" => Some(Self::Retrying),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Runnable states are picked up by the reconciliation scan.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// One run of a workflow.
///
/// The tuple `(project_id, workflow_id, client_request_id)` is unique;
/// creating a second execution with the same tuple returns the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub project_id: String,
    pub workflow_id: String,
    pub client_request_id: String,
    pub status: ExecutionStatus,
    pub inputs: JsonMap,
    pub outputs: Option<JsonMap>,
    pub error: Option<JsonMap>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attempt record for one graph node within an execution.
///
/// Unique on `(execution_id, node_id)`. `attempt` counts dispatches started
/// and is persisted together with the `RUNNING` transition, so a row observed
/// in `RUNNING` always carries the attempt number currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub executor_type: String,
    pub status: NodeStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub input: JsonMap,
    pub output: Option<JsonMap>,
    pub error: Option<JsonMap>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Append-only audit entry, ordered by `created_at` within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub node_id: Option<String>,
    pub event_type: String,
    pub message: String,
    pub payload: JsonMap,
    pub created_at: DateTime<Utc>,
}

/// Aggregate execution counts for one project.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExecutionStats {
    pub total_executions: i64,
    pub running_executions: i64,
    pub success_count: i64,
    pub failed_count: i64,
}

/// Event types written by the engine itself.
pub mod event_types {
    pub const COMPENSATION_STARTED: &str = "COMPENSATION_STARTED";
    pub const COMPENSATION_COMPLETED: &str = "COMPENSATION_COMPLETED";
    pub const COMPENSATION_NODE_STARTED: &str = "COMPENSATION_NODE_STARTED";
    pub const COMPENSATION_NODE_SUCCEEDED: &str = "COMPENSATION_NODE_SUCCEEDED";
    pub const COMPENSATION_NODE_FAILED: &str = "COMPENSATION_NODE_FAILED";
}

// ============================================================================
// Tests
// ============================================================================
