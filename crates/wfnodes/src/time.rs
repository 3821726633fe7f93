use async_trait::async_trait;
use serde_json::json;
use tokio::time::{sleep, Duration};
use wfcore::{
    NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType, ParameterKind,
    ParameterSpec,
};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl NodeType for DelayNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("time.delay", NodeGroup::Action)
            .display_name("Delay")
            .description("Delay execution for specified milliseconds")
            .category("time")
            .parameter(ParameterSpec::optional(
                "delay_ms",
                ParameterKind::Number,
                Some(json!(1000)),
            ))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .parameter_or("delay_ms", json!(1000))
            .as_f64()
            .unwrap_or(1000.0)
            .max(0.0) as u64;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {
                Ok(NodeOutput::main(ctx.input().clone()))
            }
        }
    }
}
