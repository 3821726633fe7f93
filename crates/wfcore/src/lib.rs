//! Core abstractions for the workflow engine.
//!
//! The graph model, graph algorithms, expression resolution, node type
//! capabilities, static data and execution records live here. Nothing in
//! this crate spawns tasks; the runtime crate drives execution.

mod error;
pub mod events;
mod execution;
pub mod expression;
mod graph;
mod node;
mod static_data;
mod value;
mod workflow;

pub use error::{ExpressionError, FailureKind, FlowError, NodeError, NodeFailure, WorkflowError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, ExecutionId, NodeEvent};
pub use execution::{
    ExecutionMode, ExecutionRecord, ExecutionRequest, NodeRun, NodeStatus, RunStatus, SkipReason,
};
pub use expression::ExpressionContext;
pub use graph::ConnectionFilter;
pub use node::{
    NodeContext, NodeDescription, NodeGroup, NodeOutput, NodeType, NodeTypes, ParameterKind,
    ParameterSpec, PortDefinition, RateLimit,
};
pub use static_data::{node_namespace, StaticData, StaticDataSnapshot, GLOBAL_NAMESPACE};
pub use value::{merge_maps, param_str, ValueExt};
pub use workflow::{
    Connection, ConnectionType, ErrorHandling, NodeId, NodeSpec, Position, RetryPolicy, Workflow,
    WorkflowDefinition, WorkflowId, WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
