use async_trait::async_trait;
use serde_json::{json, Value};
use wfcore::{
    param_str, NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType,
    ParameterKind, ParameterSpec, GLOBAL_NAMESPACE,
};

/// Write values into workflow static data so later runs can read them.
pub struct StaticSetNode;

#[async_trait]
impl NodeType for StaticSetNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("static.set", NodeGroup::Action)
            .display_name("Set Static Data")
            .description("Merge values into a static data namespace")
            .category("data")
            .parameter(ParameterSpec::required("values", ParameterKind::Object))
            .parameter(ParameterSpec::optional(
                "namespace",
                ParameterKind::String,
                Some(json!(GLOBAL_NAMESPACE)),
            ))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let Value::Object(values) = ctx.require_parameter("values")?.clone() else {
            return Err(NodeError::Configuration("values must be an object".to_string()));
        };
        let namespace = param_str(&ctx.parameters, "namespace").unwrap_or(GLOBAL_NAMESPACE);

        tracing::debug!("Static data {} <- {} keys", namespace, values.len());
        ctx.static_data.merge(namespace, values);

        Ok(NodeOutput::main(ctx.input().clone()))
    }
}
