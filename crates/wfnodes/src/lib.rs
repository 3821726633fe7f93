//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod flow;
mod http;
mod query;
mod static_set;
mod time;
mod transform;
mod trigger;

pub use debug::DebugNode;
pub use flow::{IfNode, StopAndErrorNode};
pub use http::HttpRequestNode;
pub use query::QueryTransformNode;
pub use static_set::StaticSetNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode, SetNode};
pub use trigger::{ManualTriggerNode, PollTriggerNode};

use std::sync::Arc;
use wfcore::{NodeType, WorkflowError};
use wfruntime::NodeRegistry;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) -> Result<(), WorkflowError> {
    let nodes: Vec<Arc<dyn NodeType>> = vec![
        Arc::new(ManualTriggerNode),
        Arc::new(PollTriggerNode),
        Arc::new(HttpRequestNode::new()),
        Arc::new(SetNode),
        Arc::new(JsonParseNode),
        Arc::new(JsonStringifyNode),
        Arc::new(QueryTransformNode),
        Arc::new(IfNode),
        Arc::new(StopAndErrorNode),
        Arc::new(DebugNode),
        Arc::new(DelayNode),
        Arc::new(StaticSetNode),
    ];
    for node in nodes {
        let name = node.describe().name;
        registry.register(name, node)?;
    }
    Ok(())
}

/// A registry holding every standard node.
pub fn standard_registry() -> Result<NodeRegistry, WorkflowError> {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
