//! Execution requests and the records a run leaves behind.

use crate::error::NodeFailure;
use crate::events::ExecutionId;
use crate::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Manual,
    Trigger,
    Test,
}

impl ExecutionMode {
    /// Trigger runs see live data; manual and test runs honour pinned outputs.
    pub fn uses_pin_data(self) -> bool {
        !matches!(self, ExecutionMode::Trigger)
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ExecutionMode::Manual),
            "trigger" => Ok(ExecutionMode::Trigger),
            "test" => Ok(ExecutionMode::Test),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

/// What a caller asks the engine to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Run only what is needed to reach this node.
    #[serde(default)]
    pub destination_node: Option<String>,
    /// Data handed to the start node instead of an empty object.
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl ExecutionRequest {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_destination(mut self, node: impl Into<String>) -> Self {
        self.destination_node = Some(node.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed | RunStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Every input came from a branch that did not fire (an `if` that went
    /// the other way, an error output of a node that succeeded).
    BranchNotTaken,
    /// An input was lost because an upstream node failed.
    UpstreamFailed,
    Canceled,
    Disabled,
    /// Outside the part of the graph this run covers.
    NotReached,
}

impl SkipReason {
    /// Skips that do not count against the run outcome.
    pub fn is_legitimate(&self) -> bool {
        !matches!(self, SkipReason::UpstreamFailed | SkipReason::Canceled)
    }
}

/// Everything recorded about one node in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub node_type: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BTreeMap<usize, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub retries: u32,
    pub pinned: bool,
    /// Position in dispatch order, when the node was dispatched at all.
    pub execution_index: Option<usize>,
}

impl NodeRun {
    pub fn pending(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            status: NodeStatus::Pending,
            skip_reason: None,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
            retries: 0,
            pinned: false,
            execution_index: None,
        }
    }

    pub fn skip(&mut self, reason: SkipReason) {
        self.status = NodeStatus::Skipped;
        self.skip_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }
}

/// Result of one workflow run, owned by whoever persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub start_node: Option<String>,
    pub destination_node: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub finished: bool,
    pub static_data_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub nodes: HashMap<String, NodeRun>,
}

impl ExecutionRecord {
    pub fn node(&self, name: &str) -> Option<&NodeRun> {
        self.nodes.get(name)
    }

    pub fn node_status(&self, name: &str) -> Option<NodeStatus> {
        self.nodes.get(name).map(|run| run.status)
    }

    /// Main output 0 of a node, if it produced one.
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.nodes
            .get(name)
            .and_then(|run| run.output.as_ref())
            .and_then(|outputs| outputs.get(&0))
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|run| run.status == status).count()
    }

    /// Node names in the order they were dispatched.
    pub fn execution_order(&self) -> Vec<&str> {
        let mut dispatched: Vec<(usize, &str)> = self
            .nodes
            .iter()
            .filter_map(|(name, run)| run.execution_index.map(|i| (i, name.as_str())))
            .collect();
        dispatched.sort_unstable();
        dispatched.into_iter().map(|(_, name)| name).collect()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.stopped_at
            .map(|stop| (stop - self.started_at).num_milliseconds())
    }
}
