//! Chronological view of one execution.
//!
//! Merges execution timestamps, node attempt timestamps, and the explicit
//! event log into a single sorted stream. Read-only; nothing here mutates
//! stored state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{
    Execution, ExecutionEvent, ExecutionId, ExecutionNode, ExecutionStatus, JsonMap, NodeStatus,
};
use crate::store::{EventStore, ExecutionStore, NodeStore, StoreResult};

pub const EXECUTION_STARTED: &str = "EXECUTION_STARTED";
pub const EXECUTION_SUCCEEDED: &str = "EXECUTION_SUCCEEDED";
pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
pub const NODE_STARTED: &str = "NODE_STARTED";
pub const NODE_SUCCEEDED: &str = "NODE_SUCCEEDED";
pub const NODE_FAILED: &str = "NODE_FAILED";

/// One entry in the derived timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub entry_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonMap>,
}

/// The full derived view for one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTimeline {
    pub execution_id: ExecutionId,
    pub project_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub entries: Vec<TimelineEntry>,
}

/// Assemble the timeline from already loaded records.
pub fn build_timeline(
    execution: &Execution,
    nodes: &[ExecutionNode],
    events: &[ExecutionEvent],
) -> ExecutionTimeline {
    let mut entries: Vec<TimelineEntry> = Vec::new();

    if let Some(started_at) = execution.started_at {
        entries.push(TimelineEntry {
            timestamp: started_at,
            entry_type: EXECUTION_STARTED.to_string(),
            node_id: None,
            executor: None,
            message: Some("Execution started".to_string()),
            duration_ms: None,
            payload: None,
        });
    }

    for node in nodes {
        if let Some(started_at) = node.started_at {
            entries.push(TimelineEntry {
                timestamp: started_at,
                entry_type: NODE_STARTED.to_string(),
                node_id: Some(node.node_id.clone()),
                executor: Some(node.executor_type.clone()),
                message: None,
                duration_ms: None,
                payload: None,
            });
        }
        if let Some(completed_at) = node.completed_at {
            let entry_type = if node.status == NodeStatus::Failed {
                NODE_FAILED
            } else {
                NODE_SUCCEEDED
            };
            entries.push(TimelineEntry {
                timestamp: completed_at,
                entry_type: entry_type.to_string(),
                node_id: Some(node.node_id.clone()),
                executor: None,
                message: None,
                duration_ms: node.duration_ms,
                payload: node.error.clone(),
            });
        }
    }

    for event in events {
        entries.push(TimelineEntry {
            timestamp: event.created_at,
            entry_type: event.event_type.clone(),
            node_id: event.node_id.clone(),
            executor: None,
            message: Some(event.message.clone()),
            duration_ms: None,
            payload: Some(event.payload.clone()),
        });
    }

    if let Some(completed_at) = execution.completed_at {
        let entry_type = if execution.status == ExecutionStatus::Failed {
            EXECUTION_FAILED
        } else {
            EXECUTION_SUCCEEDED
        };
        entries.push(TimelineEntry {
            timestamp: completed_at,
            entry_type: entry_type.to_string(),
            node_id: None,
            executor: None,
            message: None,
            duration_ms: None,
            payload: execution.error.clone(),
        });
    }

    entries.sort_by_key(|e| e.timestamp);

    ExecutionTimeline {
        execution_id: execution.id,
        project_id: execution.project_id.clone(),
        workflow_id: execution.workflow_id.clone(),
        status: execution.status,
        started_at: execution.started_at,
        completed_at: execution.completed_at,
        entries,
    }
}

/// Loads the records behind a timeline from the stores.
pub struct TimelineBuilder {
    executions: Arc<dyn ExecutionStore>,
    nodes: Arc<dyn NodeStore>,
    events: Arc<dyn EventStore>,
}

impl TimelineBuilder {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        nodes: Arc<dyn NodeStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            executions,
            nodes,
            events,
        }
    }

    pub async fn build(
        &self,
        project_id: &str,
        execution_id: ExecutionId,
    ) -> StoreResult<ExecutionTimeline> {
        let execution = self.executions.get(project_id, execution_id).await?;
        let nodes = self.nodes.list_by_execution(execution_id).await?;
        let events = self.events.list(execution_id).await?;
        Ok(build_timeline(&execution, &nodes, &events))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn execution(status: ExecutionStatus) -> Execution {
        Execution {
            id: ExecutionId::new(),
            project_id: "proj".into(),
            workflow_id: "wf".into(),
            client_request_id: "req".into(),
            status,
            inputs: JsonMap::new(),
            outputs: None,
            error: None,
            started_at: Some(at(0)),
            completed_at: Some(at(10)),
            created_at: at(0),
            updated_at: at(10),
        }
    }

    fn node(id: &str, status: NodeStatus, started: i64, completed: i64) -> ExecutionNode {
        ExecutionNode {
            id: Uuid::new_v4(),
            execution_id: ExecutionId::new(),
            node_id: id.into(),
            executor_type: "noop".into(),
            status,
            attempt: 1,
            max_attempts: 3,
            input: JsonMap::new(),
            output: None,
            error: None,
            started_at: Some(at(started)),
            completed_at: Some(at(completed)),
            duration_ms: Some((completed - started) * 1000),
        }
    }

    #[test]
    fn entries_are_sorted_chronologically() {
        let execution = execution(ExecutionStatus::Succeeded);
        let nodes = vec![
            node("b", NodeStatus::Succeeded, 4, 6),
            node("a", NodeStatus::Succeeded, 1, 3),
        ];
        let timeline = build_timeline(&execution, &nodes, &[]);

        let types: Vec<&str> = timeline
            .entries
            .iter()
            .map(|e| e.entry_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec![
                EXECUTION_STARTED,
                NODE_STARTED,
                NODE_SUCCEEDED,
                NODE_STARTED,
                NODE_SUCCEEDED,
                EXECUTION_SUCCEEDED,
            ]
        );
        assert_eq!(timeline.entries[1].node_id.as_deref(), Some("a"));
        assert_eq!(timeline.entries[3].node_id.as_deref(), Some("b"));
        assert!(
            timeline
                .entries
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp)
        );
    }

    #[test]
    fn failed_nodes_and_executions_use_failure_types() {
        let execution = execution(ExecutionStatus::Failed);
        let nodes = vec![node("a", NodeStatus::Failed, 1, 3)];
        let timeline = build_timeline(&execution, &nodes, &[]);

        assert!(
            timeline
                .entries
                .iter()
                .any(|e| e.entry_type == NODE_FAILED)
        );
        assert_eq!(
            timeline.entries.last().unwrap().entry_type,
            EXECUTION_FAILED
        );
    }

    #[test]
    fn explicit_events_are_interleaved() {
        let execution = execution(ExecutionStatus::Failed);
        let nodes = vec![node("a", NodeStatus::Succeeded, 1, 3)];
        let events = vec![ExecutionEvent {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            node_id: Some("a".into()),
            event_type: "COMPENSATION_NODE_STARTED".into(),
            message: "Compensation step started".into(),
            payload: JsonMap::new(),
            created_at: at(8),
        }];
        let timeline = build_timeline(&execution, &nodes, &events);

        let position = timeline
            .entries
            .iter()
            .position(|e| e.entry_type == "COMPENSATION_NODE_STARTED")
            .unwrap();
        assert_eq!(position, timeline.entries.len() - 2);
    }
}
