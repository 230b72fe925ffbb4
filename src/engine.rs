//! Reconciliation engine driving executions to a terminal state.
//!
//! One engine task owns one execution. Each pass lists the node rows, skips
//! or dispatches the runnable ones, then checks completion against a fresh
//! snapshot. A pass that neither changes any row nor observes a running node
//! means the graph can no longer make progress and the execution fails as
//! deadlocked.
//!
//! State transitions are individual durable writes; a crash at any point is
//! recovered by re-entering the loop against the stored rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::graph::{Condition, Graph, GraphNode};
use crate::model::{
    Execution, ExecutionId, ExecutionNode, JsonMap, NodeStatus,
};
use crate::module::{ModuleError, ModuleRegistry};
use crate::resolver::{ResolveError, resolve_inputs, unwrap_output};
use crate::store::{
    EventStore, ExecutionStore, NewExecution, NewExecutionEvent, NewExecutionNode, NodeStore,
    StoreError, WorkflowStore,
};
use crate::executor::{ExecutorError, ExecutorRegistry};

/// Delay between reconciliation passes when work remains.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempt limit applied when a node declares no retry policy.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reconciliation task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Request to create (or re-join) an execution.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub project_id: String,
    pub workflow_id: String,
    pub client_request_id: String,
    pub inputs: JsonMap,
}

/// Handle to a spawned reconciliation task.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), EngineError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Ask the loop to stop at its next suspension point.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the loop to finish.
    pub async fn join(self) -> Result<(), EngineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(EngineError::Task(err.to_string())),
        }
    }
}

/// Dispatch failure routed through retry handling.
#[derive(Debug, Error)]
enum DispatchError {
    #[error("{0}")]
    Module(#[from] ModuleError),

    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("{0}")]
    Executor(#[from] ExecutorError),

    #[error("{0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Input resolution failures and permanent executor failures cannot heal
    /// with another attempt; everything else may.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Module(_) | Self::Store(_) => true,
            Self::Resolve(_) => false,
            Self::Executor(err) => err.is_retryable(),
        }
    }
}

/// The reconciliation engine. Cloning shares the underlying stores, so one
/// engine value can drive many concurrent executions.
#[derive(Clone)]
pub struct Engine {
    pub(crate) executions: Arc<dyn ExecutionStore>,
    pub(crate) nodes: Arc<dyn NodeStore>,
    pub(crate) events: Arc<dyn EventStore>,
    pub(crate) workflows: Arc<dyn WorkflowStore>,
    pub(crate) modules: Arc<dyn ModuleRegistry>,
    pub(crate) executors: Arc<ExecutorRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        nodes: Arc<dyn NodeStore>,
        events: Arc<dyn EventStore>,
        workflows: Arc<dyn WorkflowStore>,
        modules: Arc<dyn ModuleRegistry>,
        executors: Arc<ExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executions,
            nodes,
            events,
            workflows,
            modules,
            executors,
            config,
        }
    }

    /// Create the execution row, idempotent on the client request id. The
    /// caller decides when to start reconciliation.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Execution, EngineError> {
        let execution = self
            .executions
            .create(NewExecution {
                project_id: request.project_id,
                workflow_id: request.workflow_id,
                client_request_id: request.client_request_id,
                inputs: request.inputs,
            })
            .await?;
        Ok(execution)
    }

    /// Run one execution to a terminal state on the current task.
    pub async fn start_execution(
        &self,
        project_id: &str,
        execution_id: ExecutionId,
    ) -> Result<(), EngineError> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run(project_id, execution_id, shutdown_rx).await
    }

    /// Spawn the reconciliation loop on a background task.
    pub fn start_detached(&self, project_id: String, execution_id: ExecutionId) -> ExecutionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let result = engine.run(&project_id, execution_id, shutdown_rx).await;
            if let Err(err) = &result {
                error!(%execution_id, ?err, "reconciliation terminated with error");
            }
            result
        });
        ExecutionHandle {
            execution_id,
            shutdown_tx,
            handle,
        }
    }

    /// Re-adopt executions left `RUNNING` by a previous process. Orphaned
    /// `RUNNING` node rows are flipped to `RETRYING` while attempts remain,
    /// otherwise failed, then reconciliation resumes.
    pub async fn recover(&self) -> Result<Vec<ExecutionHandle>, EngineError> {
        let running = self.executions.list_running().await?;
        let mut handles = Vec::with_capacity(running.len());
        for execution in running {
            let rows = self.nodes.list_by_execution(execution.id).await?;
            for row in rows.iter().filter(|r| r.status == NodeStatus::Running) {
                if row.attempt < row.max_attempts {
                    info!(
                        execution_id = %execution.id,
                        node_id = %row.node_id,
                        attempt = row.attempt,
                        "requeueing node interrupted mid-attempt"
                    );
                    self.nodes
                        .mark_retrying(execution.id, &row.node_id, row.attempt)
                        .await?;
                } else {
                    self.nodes
                        .mark_failed(
                            execution.id,
                            &row.node_id,
                            error_payload("node stuck in running state after max attempts"),
                        )
                        .await?;
                }
            }
            handles.push(self.start_detached(execution.project_id.clone(), execution.id));
        }
        Ok(handles)
    }

    async fn run(
        &self,
        project_id: &str,
        execution_id: ExecutionId,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(%execution_id, project_id, "starting execution");
        metrics::counter!("capstan_executions_started_total").increment(1);

        let execution = self.executions.get(project_id, execution_id).await?;
        self.executions.mark_running(execution_id).await?;

        let workflow = self
            .workflows
            .get(&execution.project_id, &execution.workflow_id)
            .await?;
        let graph = Graph::build(&workflow.definition);
        debug!(%execution_id, node_count = graph.len(), "graph built");

        self.ensure_nodes(&execution, &graph).await?;
        self.reconcile(&execution, &graph, shutdown_rx).await
    }

    /// Ensure one node row per graph node, with the base input materialized
    /// as `with` defaults overridden by the workflow-level inputs.
    async fn ensure_nodes(&self, execution: &Execution, graph: &Graph) -> Result<(), EngineError> {
        for node in graph.nodes() {
            let mut input = node.with.clone();
            for (key, value) in &execution.inputs {
                input.insert(key.clone(), value.clone());
            }
            let max_attempts = node
                .retry
                .map(|r| r.max_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS);
            self.nodes
                .upsert(NewExecutionNode {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    executor_type: node.uses.clone(),
                    input,
                    max_attempts,
                })
                .await?;
        }
        debug!(execution_id = %execution.id, count = graph.len(), "node rows ensured");
        Ok(())
    }

    async fn reconcile(
        &self,
        execution: &Execution,
        graph: &Graph,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let execution_id = execution.id;
        let mut iteration = 0u64;

        loop {
            iteration += 1;
            if *shutdown_rx.borrow() {
                info!(%execution_id, iteration, "reconciliation interrupted by shutdown");
                return Ok(());
            }

            let rows = self.nodes.list_by_execution(execution_id).await?;
            let statuses: HashMap<&str, NodeStatus> = rows
                .iter()
                .map(|r| (r.node_id.as_str(), r.status))
                .collect();

            let mut progress = false;
            for row in rows.iter().filter(|r| r.status.is_runnable()) {
                let Some(node) = graph.node(&row.node_id) else {
                    warn!(%execution_id, node_id = %row.node_id, "node row has no graph node");
                    self.executions
                        .mark_failed(execution_id, error_payload("node not in graph"))
                        .await?;
                    return Ok(());
                };

                // A skipped dependency can never succeed, so everything
                // downstream of it skips as well.
                if node
                    .depends
                    .iter()
                    .any(|dep| statuses.get(dep.as_str()) == Some(&NodeStatus::Skipped))
                {
                    self.skip_node(execution_id, &row.node_id).await;
                    progress = true;
                    continue;
                }

                let deps_done = node
                    .depends
                    .iter()
                    .all(|dep| statuses.get(dep.as_str()) == Some(&NodeStatus::Succeeded));
                if !deps_done {
                    continue;
                }

                if let Some(condition) = &node.when {
                    if !condition_passes(condition, &rows) {
                        debug!(%execution_id, node_id = %row.node_id, "condition false, skipping");
                        self.skip_node(execution_id, &row.node_id).await;
                        progress = true;
                        continue;
                    }
                }

                progress |= self.execute_node(execution, row, node).await;
            }

            let rows = self.nodes.list_by_execution(execution_id).await?;
            if self.check_completed(execution, &rows).await? {
                return Ok(());
            }

            let has_running = rows.iter().any(|r| r.status == NodeStatus::Running);
            if !progress && !has_running {
                warn!(%execution_id, iteration, "no progress possible, failing as deadlocked");
                metrics::counter!("capstan_executions_failed_total").increment(1);
                self.executions
                    .mark_failed(execution_id, error_payload("deadlock"))
                    .await?;
                self.run_compensation(&execution.project_id, execution_id)
                    .await;
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_delay) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        info!(%execution_id, iteration, "reconciliation shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one attempt of a runnable node. Returns whether any row
    /// changed. Store write failures are logged and retried by later passes.
    async fn execute_node(
        &self,
        execution: &Execution,
        row: &ExecutionNode,
        node: &GraphNode,
    ) -> bool {
        let execution_id = execution.id;
        let attempt = row.attempt + 1;
        debug!(
            %execution_id,
            node_id = %row.node_id,
            attempt,
            max_attempts = row.max_attempts,
            executor_type = %row.executor_type,
            "dispatching node"
        );

        let module = match self
            .modules
            .resolve(&execution.project_id, &row.executor_type)
            .await
        {
            Ok(module) => module,
            Err(err) => {
                warn!(%execution_id, node_id = %row.node_id, %err, "module resolution failed");
                self.fail_or_retry(row, attempt, err.into()).await;
                return true;
            }
        };

        // No executor for this runtime is an engine-side gap, not a node
        // failure: leave the row untouched so stalled graphs surface as
        // deadlock rather than burning attempts.
        let Some(executor) = self.executors.get(&module.runtime) else {
            warn!(
                %execution_id,
                node_id = %row.node_id,
                runtime = %module.runtime,
                "no executor registered for runtime"
            );
            return false;
        };

        if let Err(err) = self
            .nodes
            .mark_running(execution_id, &row.node_id, attempt)
            .await
        {
            warn!(%execution_id, node_id = %row.node_id, %err, "failed to mark node running");
            return true;
        }

        let inputs = match self.resolved_inputs(execution_id, node, &row.input).await {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(%execution_id, node_id = %row.node_id, %err, "input resolution failed");
                self.fail_or_retry(row, attempt, err).await;
                return true;
            }
        };

        metrics::counter!("capstan_node_dispatches_total").increment(1);
        match executor.execute(node, &inputs).await {
            Ok(output) => {
                debug!(%execution_id, node_id = %row.node_id, "node succeeded");
                let mut wrapped = JsonMap::new();
                wrapped.insert("output".to_string(), Value::Object(output));
                if let Err(err) = self
                    .nodes
                    .mark_succeeded(execution_id, &row.node_id, wrapped)
                    .await
                {
                    warn!(%execution_id, node_id = %row.node_id, %err, "failed to persist success");
                }
            }
            Err(err) => {
                self.fail_or_retry(row, attempt, err.into()).await;
            }
        }
        true
    }

    /// Re-list sibling rows and merge upstream outputs into the node input.
    async fn resolved_inputs(
        &self,
        execution_id: ExecutionId,
        node: &GraphNode,
        base: &JsonMap,
    ) -> Result<JsonMap, DispatchError> {
        if node.inputs.is_empty() {
            return Ok(base.clone());
        }
        let rows = self.nodes.list_by_execution(execution_id).await?;
        let outputs: HashMap<String, &JsonMap> = rows
            .iter()
            .filter(|r| r.status == NodeStatus::Succeeded)
            .filter_map(|r| {
                r.output
                    .as_ref()
                    .map(|o| (r.node_id.clone(), unwrap_output(o)))
            })
            .collect();
        Ok(resolve_inputs(base, &node.inputs, &outputs)?)
    }

    /// Record the failed attempt: schedule a retry while attempts remain and
    /// the failure is retryable, otherwise fail the node.
    async fn fail_or_retry(&self, row: &ExecutionNode, attempt: i32, err: DispatchError) {
        let execution_id = row.execution_id;
        if err.is_retryable() && attempt < row.max_attempts {
            info!(
                %execution_id,
                node_id = %row.node_id,
                attempt,
                max_attempts = row.max_attempts,
                %err,
                "node attempt failed, will retry"
            );
            metrics::counter!("capstan_node_retries_total").increment(1);
            if let Err(store_err) = self
                .nodes
                .mark_retrying(execution_id, &row.node_id, attempt)
                .await
            {
                warn!(%execution_id, node_id = %row.node_id, %store_err, "failed to mark retry");
            }
            return;
        }

        warn!(
            %execution_id,
            node_id = %row.node_id,
            attempt,
            %err,
            "node failed"
        );
        let mut payload = JsonMap::new();
        payload.insert("message".to_string(), Value::String(err.to_string()));
        if let Err(store_err) = self
            .nodes
            .mark_failed(execution_id, &row.node_id, payload)
            .await
        {
            warn!(%execution_id, node_id = %row.node_id, %store_err, "failed to mark failure");
        }
    }

    async fn skip_node(&self, execution_id: ExecutionId, node_id: &str) {
        let mut payload = JsonMap::new();
        payload.insert("skipped".to_string(), Value::Bool(true));
        if let Err(err) = self
            .nodes
            .mark_skipped(execution_id, node_id, payload)
            .await
        {
            warn!(%execution_id, node_id, %err, "failed to mark node skipped");
        }
    }

    /// Decide whether the execution is finished and close it out if so.
    async fn check_completed(
        &self,
        execution: &Execution,
        rows: &[ExecutionNode],
    ) -> Result<bool, EngineError> {
        let execution_id = execution.id;

        let failed: Vec<&str> = rows
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
            .map(|r| r.node_id.as_str())
            .collect();
        if !failed.is_empty() {
            warn!(%execution_id, failed_nodes = ?failed, "execution failed");
            metrics::counter!("capstan_executions_failed_total").increment(1);
            let mut payload = error_payload("one or more nodes failed");
            payload.insert("failed_nodes".to_string(), json!(failed));
            self.executions.mark_failed(execution_id, payload).await?;
            self.run_compensation(&execution.project_id, execution_id)
                .await;
            return Ok(true);
        }

        if rows.iter().any(|r| r.status.is_runnable()) {
            return Ok(false);
        }

        for row in rows.iter().filter(|r| r.status == NodeStatus::Running) {
            // Still RUNNING on its last attempt with nothing in flight means
            // a previous process died between dispatch and persist.
            if row.attempt >= row.max_attempts {
                warn!(
                    %execution_id,
                    node_id = %row.node_id,
                    attempt = row.attempt,
                    "node stuck in running state after max attempts"
                );
                self.nodes
                    .mark_failed(
                        execution_id,
                        &row.node_id,
                        error_payload("node stuck in running state after max attempts"),
                    )
                    .await?;
                metrics::counter!("capstan_executions_failed_total").increment(1);
                let mut payload = error_payload("one or more nodes failed");
                payload.insert("failed_nodes".to_string(), json!([&row.node_id]));
                self.executions.mark_failed(execution_id, payload).await?;
                self.run_compensation(&execution.project_id, execution_id)
                    .await;
                return Ok(true);
            }
        }
        if rows.iter().any(|r| r.status == NodeStatus::Running) {
            return Ok(false);
        }

        // Every node is SUCCEEDED or SKIPPED.
        let mut outputs = JsonMap::new();
        for row in rows {
            let value = row
                .output
                .as_ref()
                .map(|o| Value::Object(o.clone()))
                .unwrap_or(Value::Null);
            outputs.insert(row.node_id.clone(), value);
        }
        info!(%execution_id, node_count = rows.len(), "execution succeeded");
        metrics::counter!("capstan_executions_succeeded_total").increment(1);
        self.executions.mark_completed(execution_id, outputs).await?;
        Ok(true)
    }

    async fn run_compensation(&self, project_id: &str, execution_id: ExecutionId) {
        if let Err(err) = self.compensate(project_id, execution_id).await {
            warn!(%execution_id, %err, "compensation pass failed");
        }
    }

    pub(crate) async fn append_event(&self, event: NewExecutionEvent) {
        let execution_id = event.execution_id;
        if let Err(err) = self.events.append(event).await {
            warn!(%execution_id, %err, "failed to append execution event");
        }
    }
}

/// Evaluate a `when` clause against the current rows. The referenced node
/// must have succeeded; otherwise the predicate is false.
fn condition_passes(condition: &Condition, rows: &[ExecutionNode]) -> bool {
    let source = rows
        .iter()
        .find(|r| r.node_id == condition.from_node && r.status == NodeStatus::Succeeded);
    let Some(source) = source else {
        return false;
    };
    let output = source.output.as_ref().map(unwrap_output);
    let value = output.and_then(|o| o.get(&condition.key));
    condition.evaluate(value)
}

fn error_payload(reason: &str) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("reason".to_string(), Value::String(reason.to_string()));
    payload
}
