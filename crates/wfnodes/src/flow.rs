use async_trait::async_trait;
use serde_json::{json, Value};
use wfcore::{
    param_str, NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType,
    ParameterKind, ParameterSpec, PortDefinition, ValueExt,
};

const OPERATIONS: &[&str] = &["equals", "not_equals", "gt", "lt", "contains", "is_empty"];

/// Route the input to `true` (port 0) or `false` (port 1).
pub struct IfNode;

#[async_trait]
impl NodeType for IfNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("flow.if", NodeGroup::Flow)
            .display_name("If")
            .description("Route items by comparing two values")
            .category("flow")
            .outputs(vec![PortDefinition::new("true"), PortDefinition::new("false")])
            .parameter(ParameterSpec::optional("left", ParameterKind::Any, None))
            .parameter(ParameterSpec::optional("right", ParameterKind::Any, None))
            .parameter(ParameterSpec::optional(
                "operation",
                ParameterKind::String,
                Some(json!("equals")),
            ))
    }

    fn validate(&self, parameters: &Value) -> Result<(), NodeError> {
        self.describe().validate_parameters(parameters)?;
        let operation = param_str(parameters, "operation").unwrap_or("equals");
        if !OPERATIONS.contains(&operation) {
            return Err(NodeError::Configuration(format!(
                "Unknown operation '{}', expected one of {}",
                operation,
                OPERATIONS.join(", ")
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let left = ctx.parameter_or("left", Value::Null);
        let right = ctx.parameter_or("right", Value::Null);
        let operation = param_str(&ctx.parameters, "operation").unwrap_or("equals");

        let matched = compare(operation, &left, &right)?;
        tracing::debug!("If {} {} -> {}", ctx.node_name, operation, matched);

        let port = if matched { 0 } else { 1 };
        Ok(NodeOutput::new().with_output(port, ctx.input().clone()))
    }
}

fn compare(operation: &str, left: &Value, right: &Value) -> Result<bool, NodeError> {
    let matched = match operation {
        "equals" => loosely_equal(left, right),
        "not_equals" => !loosely_equal(left, right),
        "gt" | "lt" => {
            let ordering = match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => Some(left.to_display_string().cmp(&right.to_display_string())),
            };
            match ordering {
                Some(std::cmp::Ordering::Greater) => operation == "gt",
                Some(std::cmp::Ordering::Less) => operation == "lt",
                _ => false,
            }
        }
        "contains" => match left {
            Value::String(text) => text.contains(&right.to_display_string()),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, right)),
            Value::Object(map) => map.contains_key(&right.to_display_string()),
            _ => false,
        },
        "is_empty" => match left {
            Value::Null => true,
            Value::String(text) => text.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        },
        other => {
            return Err(NodeError::Configuration(format!(
                "Unknown operation '{}'",
                other
            )))
        }
    };
    Ok(matched)
}

/// Numbers compare by value so `1` equals `1.0`.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Fail the run on purpose, optionally routed through an error branch.
pub struct StopAndErrorNode;

#[async_trait]
impl NodeType for StopAndErrorNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("flow.stop_and_error", NodeGroup::Flow)
            .display_name("Stop and Error")
            .category("flow")
            .outputs(vec![])
            .parameter(ParameterSpec::optional(
                "message",
                ParameterKind::String,
                Some(json!("Workflow stopped")),
            ))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = param_str(&ctx.parameters, "message").unwrap_or("Workflow stopped");
        Err(NodeError::ExecutionFailed(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_operations() {
        assert!(compare("equals", &json!(1), &json!(1.0)).unwrap());
        assert!(compare("not_equals", &json!("a"), &json!("b")).unwrap());
        assert!(compare("gt", &json!(3), &json!(2)).unwrap());
        assert!(compare("lt", &json!("a"), &json!("b")).unwrap());
        assert!(compare("contains", &json!("workflow"), &json!("flow")).unwrap());
        assert!(compare("contains", &json!([1, 2]), &json!(2)).unwrap());
        assert!(compare("is_empty", &json!({}), &Value::Null).unwrap());
        assert!(!compare("is_empty", &json!(0), &Value::Null).unwrap());
        assert!(compare("matches", &json!(1), &json!(1)).is_err());
    }
}
