use async_trait::async_trait;
use serde_json::{json, Value};
use wfcore::{
    NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType, ParameterKind,
    ParameterSpec, ValueExt,
};

/// Merge fixed or computed values into the item flowing through.
pub struct SetNode;

#[async_trait]
impl NodeType for SetNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("transform.set", NodeGroup::Transform)
            .display_name("Set")
            .description("Set fields on the input item")
            .category("transform")
            .parameter(ParameterSpec::required("values", ParameterKind::Object))
            .parameter(
                ParameterSpec::optional("keep_input", ParameterKind::Boolean, Some(json!(true)))
                    .describe("Start from the input item instead of an empty object"),
            )
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let values = ctx.require_parameter("values")?.clone();
        let keep_input = ctx
            .parameter_or("keep_input", json!(true))
            .as_bool()
            .unwrap_or(true);

        let mut item = match ctx.input() {
            Value::Object(_) if keep_input => ctx.input().clone(),
            _ => json!({}),
        };
        item.deep_merge(values);
        Ok(NodeOutput::main(item))
    }
}

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl NodeType for JsonParseNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("transform.json_parse", NodeGroup::Transform)
            .display_name("Parse JSON")
            .description("Parse JSON string")
            .category("transform")
            .parameter(
                ParameterSpec::optional("json", ParameterKind::String, None)
                    .describe("Text to parse; defaults to the input when it is a string"),
            )
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let text = match ctx.parameters.get("json") {
            Some(Value::String(text)) => text.as_str(),
            _ => ctx.input().as_str().ok_or_else(|| NodeError::InvalidParameter {
                name: "json".to_string(),
                expected: "string".to_string(),
                actual: ctx.input().type_name().to_string(),
            })?,
        };

        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::main(parsed))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode;

#[async_trait]
impl NodeType for JsonStringifyNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("transform.json_stringify", NodeGroup::Transform)
            .display_name("Stringify JSON")
            .description("Convert value to JSON string")
            .category("transform")
            .parameter(
                ParameterSpec::optional("value", ParameterKind::Any, None)
                    .describe("Value to serialize; defaults to the input"),
            )
            .parameter(ParameterSpec::optional(
                "pretty",
                ParameterKind::Boolean,
                Some(json!(false)),
            ))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = match ctx.parameters.get("value") {
            None | Some(Value::Null) => ctx.input(),
            Some(value) => value,
        };
        let pretty = ctx.parameter_or("pretty", json!(false)).as_bool().unwrap_or(false);

        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::main(json!({ "json": json_str })))
    }
}
