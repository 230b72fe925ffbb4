//! End-to-end engine tests against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use capstan::store::{
    EventStore, ExecutionStore, NewExecutionNode, NodeStore, WorkflowStore,
};
use capstan::{
    Engine, EngineConfig, Execution, ExecutionStatus, ExecutorError, ExecutorRegistry,
    FuncExecutor, JsonMap, MemoryModuleRegistry, MemoryStore, NodeStatus, SubmitRequest,
    TimelineBuilder, WorkflowRecord, parse_definition, timeline,
};

const PROJECT: &str = "proj";
const WORKFLOW: &str = "wf";

fn json_map(entries: &[(&str, Value)]) -> JsonMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct Harness {
    engine: Engine,
    executions: Arc<dyn ExecutionStore>,
    nodes: Arc<dyn NodeStore>,
    events: Arc<dyn EventStore>,
    workflows: Arc<dyn WorkflowStore>,
    modules: Arc<MemoryModuleRegistry>,
}

impl Harness {
    fn new(executors: ExecutorRegistry) -> Self {
        let store = MemoryStore::new();
        let executions: Arc<dyn ExecutionStore> = Arc::new(store.clone());
        let nodes: Arc<dyn NodeStore> = Arc::new(store.clone());
        let events: Arc<dyn EventStore> = Arc::new(store.clone());
        let workflows: Arc<dyn WorkflowStore> = Arc::new(store.clone());
        let modules = Arc::new(MemoryModuleRegistry::new());
        let engine = Engine::new(
            executions.clone(),
            nodes.clone(),
            events.clone(),
            workflows.clone(),
            modules.clone(),
            Arc::new(executors),
            EngineConfig {
                retry_delay: Duration::from_millis(5),
            },
        );
        Self {
            engine,
            executions,
            nodes,
            events,
            workflows,
            modules,
        }
    }

    async fn register_workflow(&self, yaml: &str) {
        let definition = parse_definition(yaml).expect("definition should parse");
        self.workflows
            .put(WorkflowRecord {
                id: Uuid::new_v4(),
                project_id: PROJECT.into(),
                name: WORKFLOW.into(),
                version: 1,
                definition,
                created_at: Utc::now(),
            })
            .await
            .expect("workflow registration");
    }

    async fn submit(&self, request_id: &str, inputs: JsonMap) -> Execution {
        self.engine
            .submit(SubmitRequest {
                project_id: PROJECT.into(),
                workflow_id: WORKFLOW.into(),
                client_request_id: request_id.into(),
                inputs,
            })
            .await
            .expect("submit")
    }

    async fn run(&self, request_id: &str, inputs: JsonMap) -> Execution {
        let execution = self.submit(request_id, inputs).await;
        self.engine
            .start_execution(PROJECT, execution.id)
            .await
            .expect("reconciliation");
        self.executions
            .get(PROJECT, execution.id)
            .await
            .expect("reload execution")
    }

    async fn node_status(&self, execution: &Execution, node_id: &str) -> (NodeStatus, i32) {
        let nodes = self
            .nodes
            .list_by_execution(execution.id)
            .await
            .expect("list nodes");
        let node = nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .unwrap_or_else(|| panic!("node {node_id} missing"));
        (node.status, node.attempt)
    }
}

// ============================================================================
// Linear success
// ============================================================================

#[tokio::test]
async fn linear_workflow_runs_nodes_in_dependency_order() {
    let invocations: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = invocations.clone();
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(move |node, _inputs| {
            seen.lock().unwrap().push(node.id.clone());
            Ok(json_map(&[("done", json!(true))]))
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    // Alphabetical order of the ids is the reverse of the dependency order.
    harness
        .register_workflow(
            r#"
nodes:
  zfetch:
    uses: step
  mbuild:
    uses: step
    depends_on: [zfetch]
  archive:
    uses: step
    depends_on: [mbuild]
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        *invocations.lock().unwrap(),
        vec!["zfetch", "mbuild", "archive"]
    );

    let outputs = execution.outputs.expect("outputs");
    for node_id in ["zfetch", "mbuild", "archive"] {
        let wrapped = outputs[node_id].as_object().expect("wrapped output");
        assert_eq!(wrapped["output"]["done"], json!(true));
    }
}

// ============================================================================
// Retry semantics
// ============================================================================

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(move |_node, _inputs| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExecutorError::Transient("connection refused".into()))
            } else {
                Ok(json_map(&[("ok", json!(true))]))
            }
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("flaky", "func");
    harness
        .register_workflow(
            r#"
nodes:
  only:
    uses: flaky
    retry:
      max_attempts: 3
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let (status, attempt) = harness.node_status(&execution, "only").await;
    assert_eq!(status, NodeStatus::Succeeded);
    assert_eq!(attempt, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_execution() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, _inputs| {
            Err(ExecutorError::Transient("upstream 503".into()))
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("flaky", "func");
    harness
        .register_workflow(
            r#"
nodes:
  only:
    uses: flaky
    retry:
      max_attempts: 2
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.clone().expect("error payload");
    assert_eq!(error["reason"], "one or more nodes failed");
    let (status, attempt) = harness.node_status(&execution, "only").await;
    assert_eq!(status, NodeStatus::Failed);
    assert_eq!(attempt, 2);
}

#[tokio::test]
async fn permanent_failures_do_not_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(move |_node, _inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ExecutorError::Permanent("schema mismatch".into()))
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("strict", "func");
    harness
        .register_workflow(
            r#"
nodes:
  only:
    uses: strict
    retry:
      max_attempts: 5
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (status, attempt) = harness.node_status(&execution, "only").await;
    assert_eq!(status, NodeStatus::Failed);
    assert_eq!(attempt, 1);
}

// ============================================================================
// Conditional execution
// ============================================================================

#[tokio::test]
async fn false_condition_skips_node_and_descendants() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|node, _inputs| {
            if node.id == "gate" {
                Ok(json_map(&[("status", json!("skip"))]))
            } else {
                Ok(JsonMap::new())
            }
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow(
            r#"
nodes:
  gate:
    uses: step
  guarded:
    uses: step
    depends_on: [gate]
    when:
      from_node: gate
      key: status
      equals: run
  downstream:
    uses: step
    depends_on: [guarded]
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        harness.node_status(&execution, "gate").await.0,
        NodeStatus::Succeeded
    );
    assert_eq!(
        harness.node_status(&execution, "guarded").await.0,
        NodeStatus::Skipped
    );
    // A skipped dependency can never succeed, so the descendant skips too.
    assert_eq!(
        harness.node_status(&execution, "downstream").await.0,
        NodeStatus::Skipped
    );

    let outputs = execution.outputs.expect("outputs");
    assert_eq!(outputs["guarded"]["skipped"], json!(true));
}

#[tokio::test]
async fn true_condition_lets_node_run() {
    let invocations: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = invocations.clone();
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(move |node, _inputs| {
            seen.lock().unwrap().push(node.id.clone());
            Ok(json_map(&[("status", json!("run"))]))
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow(
            r#"
nodes:
  gate:
    uses: step
  guarded:
    uses: step
    depends_on: [gate]
    when:
      from_node: gate
      key: status
      equals: run
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(*invocations.lock().unwrap(), vec!["gate", "guarded"]);
}

// ============================================================================
// Cross-node inputs
// ============================================================================

#[tokio::test]
async fn downstream_node_receives_referenced_output() {
    let received: Arc<Mutex<Option<JsonMap>>> = Arc::new(Mutex::new(None));
    let sink = received.clone();
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(move |node, inputs| {
            if node.id == "create" {
                Ok(json_map(&[("id", json!("r123"))]))
            } else {
                *sink.lock().unwrap() = Some(inputs.clone());
                Ok(JsonMap::new())
            }
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow(
            r#"
nodes:
  create:
    uses: step
  consume:
    uses: step
    depends_on: [create]
    with:
      region: us-east-1
    inputs:
      ref: { from_node: create, key: id }
"#,
        )
        .await;

    let execution = harness
        .run("r1", json_map(&[("region", json!("eu-west-1"))]))
        .await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    let inputs = received.lock().unwrap().clone().expect("consume ran");
    assert_eq!(inputs["ref"], json!("r123"));
    // Workflow-level inputs override static defaults.
    assert_eq!(inputs["region"], json!("eu-west-1"));
}

// ============================================================================
// Failure and compensation
// ============================================================================

#[tokio::test]
async fn failed_execution_compensates_in_reverse_completion_order() {
    let compensated: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let order = compensated.clone();

    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|node, _inputs| {
            if node.id == "ship" {
                Err(ExecutorError::Permanent("carrier rejected".into()))
            } else {
                Ok(json_map(&[("receipt", json!(node.id.clone()))]))
            }
        })),
    );
    executors.register(
        "undo",
        Arc::new(FuncExecutor::new(move |node, inputs| {
            order.lock().unwrap().push(node.id.clone());
            // Compensation receives the unwrapped output of the node.
            assert!(inputs.contains_key("receipt"), "inputs: {inputs:?}");
            if node.uses == "undo-reserve" {
                Err(ExecutorError::Transient("undo endpoint down".into()))
            } else {
                Ok(JsonMap::new())
            }
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness.modules.register_runtime("undo-reserve", "undo");
    harness.modules.register_runtime("undo-charge", "undo");
    harness
        .register_workflow(
            r#"
nodes:
  reserve:
    uses: step
    compensate:
      uses: undo-reserve
  charge:
    uses: step
    depends_on: [reserve]
    compensate:
      uses: undo-charge
  ship:
    uses: step
    depends_on: [charge]
    retry:
      max_attempts: 1
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(*compensated.lock().unwrap(), vec!["charge", "reserve"]);

    let events = harness.events.list(execution.id).await.expect("list events");
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "COMPENSATION_STARTED",
            "COMPENSATION_NODE_STARTED",
            "COMPENSATION_NODE_SUCCEEDED",
            "COMPENSATION_NODE_STARTED",
            "COMPENSATION_NODE_FAILED",
            "COMPENSATION_COMPLETED",
        ]
    );
    // A failing compensation step never changes the execution status.
    let reloaded = harness.executions.get(PROJECT, execution.id).await.unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Failed);
}

// ============================================================================
// Idempotent creation
// ============================================================================

#[tokio::test]
async fn concurrent_submits_share_one_execution() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, _inputs| Ok(JsonMap::new()))),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow("nodes:\n  only:\n    uses: step\n")
        .await;

    let (first, second) = tokio::join!(
        harness.submit("same-request", JsonMap::new()),
        harness.submit("same-request", JsonMap::new()),
    );
    assert_eq!(first.id, second.id);

    let listed = harness
        .executions
        .list(PROJECT, Some(WORKFLOW))
        .await
        .expect("list executions");
    assert_eq!(listed.len(), 1);
}

// ============================================================================
// Deadlock detection
// ============================================================================

#[tokio::test]
async fn missing_executor_is_detected_as_deadlock() {
    // The module resolves, but nothing is registered for its runtime.
    let harness = Harness::new(ExecutorRegistry::new());
    harness.modules.register_runtime("ghost", "container");
    harness
        .register_workflow("nodes:\n  only:\n    uses: ghost\n")
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.clone().expect("error payload");
    assert_eq!(error["reason"], "deadlock");
    // The node was never dispatched.
    let (status, attempt) = harness.node_status(&execution, "only").await;
    assert_eq!(status, NodeStatus::Pending);
    assert_eq!(attempt, 0);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn recover_requeues_nodes_interrupted_mid_attempt() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, _inputs| Ok(JsonMap::new()))),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow("nodes:\n  only:\n    uses: step\n")
        .await;

    // Simulate a previous process that died while the node was in flight.
    let execution = harness.submit("r1", JsonMap::new()).await;
    harness.executions.mark_running(execution.id).await.unwrap();
    harness
        .nodes
        .upsert(NewExecutionNode {
            execution_id: execution.id,
            node_id: "only".into(),
            executor_type: "step".into(),
            input: JsonMap::new(),
            max_attempts: 3,
        })
        .await
        .unwrap();
    harness
        .nodes
        .mark_running(execution.id, "only", 1)
        .await
        .unwrap();

    let handles = harness.engine.recover().await.expect("recover");
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.join().await.expect("resumed reconciliation");
    }

    let reloaded = harness.executions.get(PROJECT, execution.id).await.unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Succeeded);
    let (status, attempt) = harness.node_status(&reloaded, "only").await;
    assert_eq!(status, NodeStatus::Succeeded);
    assert_eq!(attempt, 2);
}

#[tokio::test]
async fn recover_fails_nodes_stuck_on_their_last_attempt() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, _inputs| Ok(JsonMap::new()))),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow("nodes:\n  only:\n    uses: step\n")
        .await;

    let execution = harness.submit("r1", JsonMap::new()).await;
    harness.executions.mark_running(execution.id).await.unwrap();
    harness
        .nodes
        .upsert(NewExecutionNode {
            execution_id: execution.id,
            node_id: "only".into(),
            executor_type: "step".into(),
            input: JsonMap::new(),
            max_attempts: 2,
        })
        .await
        .unwrap();
    harness
        .nodes
        .mark_running(execution.id, "only", 2)
        .await
        .unwrap();

    let handles = harness.engine.recover().await.expect("recover");
    for handle in handles {
        handle.join().await.expect("resumed reconciliation");
    }

    let reloaded = harness.executions.get(PROJECT, execution.id).await.unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Failed);
    let (status, _) = harness.node_status(&reloaded, "only").await;
    assert_eq!(status, NodeStatus::Failed);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn shutdown_leaves_execution_running_for_later_recovery() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, _inputs| {
            Err(ExecutorError::Transient("still warming up".into()))
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow(
            r#"
nodes:
  only:
    uses: step
    retry:
      max_attempts: 1000
"#,
        )
        .await;

    let execution = harness.submit("r1", JsonMap::new()).await;
    let handle = harness.engine.start_detached(PROJECT.into(), execution.id);

    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.trigger_shutdown();
    handle.join().await.expect("clean shutdown");

    let reloaded = harness.executions.get(PROJECT, execution.id).await.unwrap();
    assert_eq!(reloaded.status, ExecutionStatus::Running);
}

// ============================================================================
// Ensure-nodes idempotence
// ============================================================================

#[tokio::test]
async fn restarting_a_terminal_node_graph_preserves_rows() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(move |_node, _inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(JsonMap::new())
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow("nodes:\n  only:\n    uses: step\n")
        .await;

    let first = harness.run("r1", JsonMap::new()).await;
    assert_eq!(first.status, ExecutionStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Running the same execution again re-ensures rows without resetting
    // them, so the already succeeded node is not dispatched again.
    harness
        .engine
        .start_execution(PROJECT, first.id)
        .await
        .expect("second pass");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (status, attempt) = harness.node_status(&first, "only").await;
    assert_eq!(status, NodeStatus::Succeeded);
    assert_eq!(attempt, 1);
}

// ============================================================================
// Timeline and stats
// ============================================================================

#[tokio::test]
async fn timeline_orders_execution_and_node_entries() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, _inputs| Ok(JsonMap::new()))),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow(
            r#"
nodes:
  first:
    uses: step
  second:
    uses: step
    depends_on: [first]
"#,
        )
        .await;

    let execution = harness.run("r1", JsonMap::new()).await;

    let builder = TimelineBuilder::new(
        harness.executions.clone(),
        harness.nodes.clone(),
        harness.events.clone(),
    );
    let view = builder.build(PROJECT, execution.id).await.expect("timeline");

    assert_eq!(view.status, ExecutionStatus::Succeeded);
    assert_eq!(
        view.entries.first().unwrap().entry_type,
        timeline::EXECUTION_STARTED
    );
    assert_eq!(
        view.entries.last().unwrap().entry_type,
        timeline::EXECUTION_SUCCEEDED
    );
    let node_starts = view
        .entries
        .iter()
        .filter(|e| e.entry_type == timeline::NODE_STARTED)
        .count();
    assert_eq!(node_starts, 2);
    assert!(
        view.entries
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    );
}

#[tokio::test]
async fn stats_reflect_terminal_statuses() {
    let mut executors = ExecutorRegistry::new();
    executors.register(
        "func",
        Arc::new(FuncExecutor::new(|_node, inputs| {
            if inputs.get("fail") == Some(&json!(true)) {
                Err(ExecutorError::Permanent("boom".into()))
            } else {
                Ok(JsonMap::new())
            }
        })),
    );

    let harness = Harness::new(executors);
    harness.modules.register_runtime("step", "func");
    harness
        .register_workflow("nodes:\n  only:\n    uses: step\n")
        .await;

    let ok = harness.run("r1", JsonMap::new()).await;
    let bad = harness.run("r2", json_map(&[("fail", json!(true))])).await;
    assert_eq!(ok.status, ExecutionStatus::Succeeded);
    assert_eq!(bad.status, ExecutionStatus::Failed);

    let stats = harness.executions.get_stats(PROJECT).await.expect("stats");
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.failed_count, 1);
    assert_eq!(stats.running_executions, 0);
}
