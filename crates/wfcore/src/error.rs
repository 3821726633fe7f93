use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a single node while it runs. They are attached to the
/// node in the execution record and never abort the engine.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter '{name}': expected {expected}, got {actual}")]
    InvalidParameter {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl NodeError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Only failures of the execution step itself are worth another attempt.
    /// Parameter and expression problems are authoring errors.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::ExecutionFailed(_) | NodeError::Timeout { .. })
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            NodeError::MissingParameter(_)
            | NodeError::InvalidParameter { .. }
            | NodeError::Configuration(_) => FailureKind::InvalidParameters,
            NodeError::ExecutionFailed(_) => FailureKind::ExecutionFailed,
            NodeError::Timeout { .. } => FailureKind::Timeout,
            NodeError::Cancelled => FailureKind::Cancelled,
            NodeError::Expression(ExpressionError::UnresolvedReference { .. }) => {
                FailureKind::UnresolvedReference
            }
            NodeError::Expression(ExpressionError::EvaluationError { .. }) => {
                FailureKind::EvaluationError
            }
        }
    }

    pub fn to_failure(&self) -> NodeFailure {
        NodeFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unresolved reference to node '{node}' in '{reference}'")]
    UnresolvedReference { node: String, reference: String },

    #[error("Cannot evaluate '{expression}': {message}")]
    EvaluationError { expression: String, message: String },
}

impl ExpressionError {
    pub(crate) fn evaluation(expression: &str, message: impl Into<String>) -> Self {
        Self::EvaluationError {
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No node to start the workflow from")]
    NoStartNode,

    #[error("Unknown node type: {0}")]
    UnknownType(String),

    #[error("Node type already registered: {0}")]
    DuplicateType(String),
}

/// Serializable classification of a node failure, stored in execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnresolvedReference,
    EvaluationError,
    InvalidParameters,
    ExecutionFailed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
}
