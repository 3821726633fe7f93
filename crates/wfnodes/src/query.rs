//! Structured-data transform over JMESPath queries.
//!
//! The input is narrowed with `input_path`, shallow-merged with
//! `parameters`, written back into the input at `result_path` and finally
//! narrowed again with `output_path`. Every step is optional.

use async_trait::async_trait;
use jmespath::functions::{ArgumentType, CustomFunction, Signature};
use jmespath::{Rcvar, Runtime, Variable};
use serde_json::{json, Value};
use wfcore::{
    param_str, NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType,
    ParameterKind, ParameterSpec,
};

thread_local! {
    static RUNTIME: Runtime = query_runtime();
}

/// Builtins plus `uppercase(s)` and `split(delimiter, s)`.
fn query_runtime() -> Runtime {
    let mut runtime = Runtime::new();
    runtime.register_builtin_functions();

    runtime.register_function(
        "uppercase",
        Box::new(CustomFunction::new(
            Signature::new(vec![ArgumentType::String], None),
            Box::new(|args: &[Rcvar], _ctx| {
                let text = args[0].as_string().cloned().unwrap_or_default();
                Ok(Rcvar::new(Variable::String(text.to_uppercase())))
            }),
        )),
    );
    runtime.register_function(
        "split",
        Box::new(CustomFunction::new(
            Signature::new(vec![ArgumentType::String, ArgumentType::String], None),
            Box::new(|args: &[Rcvar], _ctx| {
                let delimiter = args[0].as_string().cloned().unwrap_or_default();
                let text = args[1].as_string().cloned().unwrap_or_default();
                let parts = text
                    .split(delimiter.as_str())
                    .map(|part| Rcvar::new(Variable::String(part.to_string())))
                    .collect();
                Ok(Rcvar::new(Variable::Array(parts)))
            }),
        )),
    );

    tracing::debug!("Query runtime initialized with builtin and custom functions");
    runtime
}

/// Run one JMESPath query against `input`.
pub fn search(query: &str, input: &Value) -> Result<Value, NodeError> {
    RUNTIME.with(|runtime| {
        let expression = runtime
            .compile(query)
            .map_err(|e| NodeError::Configuration(format!("invalid query '{}': {}", query, e)))?;
        let found = expression
            .search(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("query '{}' failed: {}", query, e)))?;
        serde_json::to_value(&*found)
            .map_err(|e| NodeError::ExecutionFailed(format!("query '{}' result: {}", query, e)))
    })
}

fn check_query(query: &str) -> Result<(), NodeError> {
    RUNTIME.with(|runtime| {
        runtime
            .compile(query)
            .map(|_| ())
            .map_err(|e| NodeError::Configuration(format!("invalid query '{}': {}", query, e)))
    })
}

/// Insert `value` at a dotted path, creating intermediate objects. Stops
/// quietly when the path runs into a non-object.
fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = target;
    while let Some(key) = parts.next() {
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(key.to_string(), value);
            return;
        }
        current = map.entry(key.to_string()).or_insert_with(|| json!({}));
    }
}

/// Reshape structured data with JMESPath queries.
pub struct QueryTransformNode;

#[async_trait]
impl NodeType for QueryTransformNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("transform.jmespath", NodeGroup::Transform)
            .display_name("JMESPath Transform")
            .description("Select, merge and place data with JMESPath queries")
            .category("transform")
            .parameter(
                ParameterSpec::optional("input_path", ParameterKind::String, None)
                    .describe("Query selecting the part of the input to work on"),
            )
            .parameter(
                ParameterSpec::optional("parameters", ParameterKind::Object, None)
                    .describe("Fields merged over the selected object"),
            )
            .parameter(
                ParameterSpec::optional("result_path", ParameterKind::String, None)
                    .describe("Dotted path in the input where the result is placed"),
            )
            .parameter(
                ParameterSpec::optional("output_path", ParameterKind::String, None)
                    .describe("Query selecting what the node emits"),
            )
    }

    fn validate(&self, parameters: &Value) -> Result<(), NodeError> {
        self.describe().validate_parameters(parameters)?;
        for name in ["input_path", "output_path"] {
            if let Some(query) = param_str(parameters, name) {
                check_query(query)?;
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let output = transform(ctx.input(), &ctx.parameters)?;
        Ok(NodeOutput::main(output))
    }
}

fn transform(input: &Value, parameters: &Value) -> Result<Value, NodeError> {
    let mut selected = match param_str(parameters, "input_path") {
        Some(query) => search(query, input)?,
        None => input.clone(),
    };

    if let (Some(Value::Object(overlay)), Value::Object(base)) =
        (parameters.get("parameters"), &mut selected)
    {
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
    }

    let placed = match param_str(parameters, "result_path") {
        Some(path) => {
            let mut placed = input.clone();
            set_path(&mut placed, path, selected);
            placed
        }
        None => selected,
    };

    match param_str(parameters, "output_path") {
        Some(query) => search(query, &placed),
        None => Ok(placed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut target = json!({"body": {"a": 1}});
        set_path(&mut target, "body.nested.value", json!(2));
        assert_eq!(target, json!({"body": {"a": 1, "nested": {"value": 2}}}));

        let mut scalar = json!({"body": 3});
        set_path(&mut scalar, "body.value", json!(2));
        assert_eq!(scalar, json!({"body": 3}));
    }

    #[test]
    fn custom_functions() {
        let input = json!({"name": "ada lovelace"});
        assert_eq!(search("uppercase(name)", &input).unwrap(), json!("ADA LOVELACE"));
        assert_eq!(
            search("split(' ', name)", &input).unwrap(),
            json!(["ada", "lovelace"])
        );
    }
}
