//! Capstan - a durable, reconciliation-based workflow execution engine.
//!
//! Workflows are DAGs of typed nodes. For each submitted execution the engine
//! ensures a durable attempt record per node, dispatches nodes once their
//! dependencies have succeeded and their condition holds, retries transient
//! failures up to a configured limit, and unwinds succeeded nodes through
//! their compensation hooks when the execution fails. Every transition is
//! persisted, so a crashed process resumes from stored state.
//!
//! ## Components
//!
//! - [`definition`]: YAML workflow definitions and validation
//! - [`graph`]: the in-memory DAG built from a definition
//! - [`store`]: persistence capabilities with in-memory and Postgres stores
//! - [`module`]: symbolic module references resolved to runtime descriptors
//! - [`executor`]: per-runtime executors and the startup registry
//! - [`engine`]: the reconciliation loop driving executions to terminal state
//! - [`timeline`]: the derived chronological view of one execution

mod compensation;

pub mod config;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod model;
pub mod module;
pub mod observability;
pub mod resolver;
pub mod store;
pub mod timeline;

// Configuration
pub use config::Config;

// Core records
pub use model::{
    Execution, ExecutionEvent, ExecutionId, ExecutionNode, ExecutionStats, ExecutionStatus,
    JsonMap, NodeStatus,
};

// Definitions and the graph
pub use definition::{
    DefinitionError, InputBinding, NodeSpec, WorkflowDefinition, parse_definition,
    validate_definition,
};
pub use graph::{Condition, Graph, GraphError, GraphNode, Predicate, RetryPolicy};

// Persistence
pub use store::{
    EventStore, ExecutionStore, MemoryStore, NewExecution, NewExecutionEvent, NewExecutionNode,
    NodeStore, PostgresStore, StoreError, StoreResult, WorkflowRecord, WorkflowStore,
};

// Modules and executors
pub use executor::{Executor, ExecutorError, ExecutorRegistry, FuncExecutor, NoopExecutor};
pub use module::{
    MemoryModuleRegistry, Module, ModuleError, ModuleRef, ModuleRegistry, verify_modules,
};

// Engine
pub use engine::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY, Engine, EngineConfig, EngineError, ExecutionHandle,
    SubmitRequest,
};

// Input resolution
pub use resolver::{ResolveError, resolve_inputs, unwrap_output};

// Timeline view
pub use timeline::{ExecutionTimeline, TimelineBuilder, TimelineEntry, build_timeline};
