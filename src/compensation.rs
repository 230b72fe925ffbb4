//! Best-effort compensation after an execution fails.
//!
//! Succeeded nodes carrying a `compensate` link are unwound in reverse
//! completion order. Every step is recorded in the event log; a failing step
//! is recorded and skipped, and nothing here ever changes the execution
//! status.

use std::cmp::Ordering;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::graph::{Graph, GraphNode};
use crate::model::{ExecutionId, ExecutionNode, JsonMap, NodeStatus, event_types};
use crate::resolver::unwrap_output;
use crate::store::NewExecutionEvent;

impl Engine {
    /// Unwind a failed execution. Reloads the stored state so the pass works
    /// from durable rows only.
    pub(crate) async fn compensate(
        &self,
        project_id: &str,
        execution_id: ExecutionId,
    ) -> Result<(), EngineError> {
        info!(%execution_id, "starting compensation");
        self.append_event(NewExecutionEvent {
            execution_id,
            node_id: None,
            event_type: event_types::COMPENSATION_STARTED.to_string(),
            message: "Compensation started".to_string(),
            payload: JsonMap::new(),
        })
        .await;

        let execution = self.executions.get(project_id, execution_id).await?;
        let workflow = self
            .workflows
            .get(&execution.project_id, &execution.workflow_id)
            .await?;
        let graph = Graph::build(&workflow.definition);

        let rows = self.nodes.list_by_execution(execution_id).await?;
        let mut completed: Vec<ExecutionNode> = rows
            .into_iter()
            .filter(|r| r.status == NodeStatus::Succeeded)
            .collect();
        // Most recently completed first; rows without a completion time last,
        // keeping their original order.
        completed.sort_by(|a, b| match (&a.completed_at, &b.completed_at) {
            (Some(x), Some(y)) => y.cmp(x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });

        for row in &completed {
            let Some(node) = graph.node(&row.node_id) else {
                continue;
            };
            let Some(link) = &node.compensate else {
                continue;
            };
            self.compensate_node(&execution.project_id, row, &link.uses, link.with.clone())
                .await;
        }

        info!(%execution_id, "compensation completed");
        self.append_event(NewExecutionEvent {
            execution_id,
            node_id: None,
            event_type: event_types::COMPENSATION_COMPLETED.to_string(),
            message: "Compensation completed".to_string(),
            payload: JsonMap::new(),
        })
        .await;
        Ok(())
    }

    /// Run one compensation hook. Failures are recorded and swallowed.
    async fn compensate_node(
        &self,
        project_id: &str,
        row: &ExecutionNode,
        uses: &str,
        with: JsonMap,
    ) {
        let execution_id = row.execution_id;
        info!(%execution_id, node_id = %row.node_id, uses, "compensating node");
        self.append_event(compensation_event(
            row,
            event_types::COMPENSATION_NODE_STARTED,
            "Compensation step started",
            uses,
            None,
        ))
        .await;

        let module = match self.modules.resolve(project_id, uses).await {
            Ok(module) => module,
            Err(err) => {
                warn!(%execution_id, node_id = %row.node_id, %err, "compensation module resolution failed");
                self.append_event(compensation_event(
                    row,
                    event_types::COMPENSATION_NODE_FAILED,
                    "Compensation module resolution failed",
                    uses,
                    Some(err.to_string()),
                ))
                .await;
                return;
            }
        };

        let Some(executor) = self.executors.get(&module.runtime) else {
            warn!(
                %execution_id,
                node_id = %row.node_id,
                runtime = %module.runtime,
                "no executor registered for compensation runtime"
            );
            self.append_event(compensation_event(
                row,
                event_types::COMPENSATION_NODE_FAILED,
                "No executor registered for compensation runtime",
                uses,
                Some(format!("runtime '{}' has no executor", module.runtime)),
            ))
            .await;
            return;
        };

        // The hook receives what the node produced, with the link's static
        // overrides applied on top.
        let mut inputs = row
            .output
            .as_ref()
            .map(|o| unwrap_output(o).clone())
            .unwrap_or_default();
        for (key, value) in &with {
            inputs.insert(key.clone(), value.clone());
        }

        let node = GraphNode::synthetic(&row.node_id, uses, with);
        match executor.execute(&node, &inputs).await {
            Ok(_) => {
                self.append_event(compensation_event(
                    row,
                    event_types::COMPENSATION_NODE_SUCCEEDED,
                    "Compensation step succeeded",
                    uses,
                    None,
                ))
                .await;
            }
            Err(err) => {
                warn!(%execution_id, node_id = %row.node_id, %err, "compensation step failed");
                self.append_event(compensation_event(
                    row,
                    event_types::COMPENSATION_NODE_FAILED,
                    "Compensation step execution failed",
                    uses,
                    Some(err.to_string()),
                ))
                .await;
            }
        }
    }
}

fn compensation_event(
    row: &ExecutionNode,
    event_type: &str,
    message: &str,
    uses: &str,
    error: Option<String>,
) -> NewExecutionEvent {
    let mut payload = JsonMap::new();
    payload.insert(
        "compensate_uses".to_string(),
        serde_json::Value::String(uses.to_string()),
    );
    if let Some(error) = error {
        payload.insert("error".to_string(), serde_json::Value::String(error));
    }
    NewExecutionEvent {
        execution_id: row.execution_id,
        node_id: Some(row.node_id.clone()),
        event_type: event_type.to_string(),
        message: message.to_string(),
        payload,
    }
}
