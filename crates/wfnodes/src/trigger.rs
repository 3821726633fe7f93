use async_trait::async_trait;
use serde_json::{json, Value};
use wfcore::{
    NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType, ParameterKind,
    ParameterSpec,
};

/// Start node for manual runs; emits the run input.
pub struct ManualTriggerNode;

#[async_trait]
impl NodeType for ManualTriggerNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("trigger.manual", NodeGroup::Trigger)
            .display_name("Manual Trigger")
            .description("Starts a workflow with the input given to the run")
            .category("trigger")
            .inputs(vec![])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = match ctx.input() {
            Value::Null => json!({}),
            value => value.clone(),
        };
        Ok(NodeOutput::main(input))
    }
}

/// Polling start node. Keeps a cursor in its own static data namespace so
/// each run picks up where the previous one stopped.
pub struct PollTriggerNode;

#[async_trait]
impl NodeType for PollTriggerNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("trigger.poll", NodeGroup::Poll)
            .display_name("Poll Trigger")
            .description("Advances a persistent cursor on every run")
            .category("trigger")
            .inputs(vec![])
            .parameter(
                ParameterSpec::optional("step", ParameterKind::Number, Some(json!(1)))
                    .describe("Amount added to the cursor per run"),
            )
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let step = ctx.parameter_or("step", json!(1)).as_i64().unwrap_or(1);
        let namespace = ctx.node_static_namespace();

        let (previous, cursor) = ctx.static_data.update(&namespace, |values| {
            let previous = values.get("cursor").and_then(Value::as_i64).unwrap_or(0);
            let cursor = previous.checked_add(step);
            if let Some(cursor) = cursor {
                values.insert("cursor".to_string(), json!(cursor));
            }
            (previous, cursor)
        });
        let cursor = cursor.ok_or_else(|| {
            NodeError::ExecutionFailed(format!(
                "cursor {} overflows when advanced by {}",
                previous, step
            ))
        })?;

        tracing::debug!("Poll {} advanced cursor {} -> {}", ctx.node_name, previous, cursor);
        Ok(NodeOutput::main(json!({ "cursor": cursor, "previous": previous })))
    }
}
