use async_trait::async_trait;
use serde_json::json;
use wfcore::{
    param_str, NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType,
    ParameterKind, ParameterSpec, ValueExt,
};

/// Simple debug node that logs its input and passes it on
pub struct DebugNode;

#[async_trait]
impl NodeType for DebugNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("debug.log", NodeGroup::Action)
            .display_name("Debug")
            .description("Logs input values for debugging")
            .category("debug")
            .parameter(ParameterSpec::optional(
                "message",
                ParameterKind::String,
                Some(json!("(no message)")),
            ))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = param_str(&ctx.parameters, "message").unwrap_or("(no message)");
        let input = ctx.input();

        ctx.events.info(format!("DEBUG: {}", message));
        ctx.events.info(format!("  input: {}", input.to_display_string()));
        tracing::info!("[{}] {}: {}", ctx.node_name, message, input);

        Ok(NodeOutput::main(input.clone()))
    }
}
