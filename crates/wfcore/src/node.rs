use crate::events::EventEmitter;
use crate::expression::contains_expression;
use crate::static_data::{node_namespace, StaticData};
use crate::value::ValueExt;
use crate::{NodeError, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

static NULL: Value = Value::Null;

/// Capability object behind a node type. New node types are added by
/// registering another implementation, never by touching the executor.
#[async_trait]
pub trait NodeType: Send + Sync {
    /// Static description: name, ports, parameter schema, rate limits.
    fn describe(&self) -> NodeDescription;

    /// Check resolved parameters before execution. The default checks the
    /// parameter schema from `describe`.
    fn validate(&self, parameters: &Value) -> Result<(), NodeError> {
        self.describe().validate_parameters(parameters)
    }

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Read-only lookup of node type descriptions, used by graph queries that
/// depend on capabilities rather than on type names.
pub trait NodeTypes: Send + Sync {
    fn description(&self, type_name: &str) -> Option<NodeDescription>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroup {
    /// Started by an explicit event (manual run, webhook).
    Trigger,
    /// Started on a schedule, keeps a cursor in static data.
    Poll,
    Action,
    Transform,
    Flow,
}

/// Metadata about a node type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub group: NodeGroup,
    pub version: u32,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    pub parameters: Vec<ParameterSpec>,
    pub rate_limit: Option<RateLimit>,
}

impl NodeDescription {
    /// Description with one main input and one main output.
    pub fn new(name: impl Into<String>, group: NodeGroup) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: String::new(),
            category: "general".to_string(),
            group,
            version: 1,
            inputs: vec![PortDefinition::new("main")],
            outputs: vec![PortDefinition::new("main")],
            parameters: Vec::new(),
            rate_limit: None,
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn inputs(mut self, inputs: Vec<PortDefinition>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: Vec<PortDefinition>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn is_trigger(&self) -> bool {
        self.group == NodeGroup::Trigger
    }

    pub fn is_poll(&self) -> bool {
        self.group == NodeGroup::Poll
    }

    /// Fill declared defaults for parameters the node does not set.
    pub fn apply_defaults(&self, parameters: &mut Value) {
        let Value::Object(map) = parameters else {
            return;
        };
        for spec in &self.parameters {
            if let Some(default) = &spec.default {
                let missing = matches!(map.get(&spec.name), None | Some(Value::Null));
                if missing {
                    map.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }

    /// Check required parameters are present and declared kinds match.
    pub fn validate_parameters(&self, parameters: &Value) -> Result<(), NodeError> {
        for spec in &self.parameters {
            match parameters.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(NodeError::MissingParameter(spec.name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(NodeError::InvalidParameter {
                        name: spec.name.clone(),
                        expected: spec.kind.as_str().to_string(),
                        actual: value.type_name().to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Check parameters as authored, before expressions are resolved.
    /// Values that still hold an expression are only checked for presence.
    pub fn validate_definition(&self, parameters: &Value) -> Result<(), NodeError> {
        for spec in &self.parameters {
            match parameters.get(&spec.name) {
                None | Some(Value::Null) if spec.required && spec.default.is_none() => {
                    return Err(NodeError::MissingParameter(spec.name.clone()));
                }
                Some(Value::String(text)) if contains_expression(text) => {}
                Some(value) if !value.is_null() && !spec.kind.accepts(value) => {
                    return Err(NodeError::InvalidParameter {
                        name: spec.name.clone(),
                        expected: spec.kind.as_str().to_string(),
                        actual: value.type_name().to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParameterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Number => "number",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Object => "object",
            ParameterKind::Array => "array",
            ParameterKind::Any => "any",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Number => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::Object => value.is_object(),
            ParameterKind::Array => value.is_array(),
            ParameterKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParameterKind, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Limits shared by every node of one type across all runs of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_concurrent: Option<usize>,
    pub per_second: Option<u32>,
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: Uuid,

    pub node_id: NodeId,

    pub node_name: String,

    pub node_type: String,

    /// Parameters with every expression already resolved
    pub parameters: Value,

    /// Values received per input index, one entry per active parent
    pub inputs: BTreeMap<usize, Vec<Value>>,

    /// Workflow static data, shared with every other run of the workflow
    pub static_data: StaticData,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token for graceful shutdown
    pub cancellation: CancellationToken,

    pub timezone: String,
}

impl NodeContext {
    /// First value on main input 0, or `null`.
    pub fn input(&self) -> &Value {
        self.inputs
            .get(&0)
            .and_then(|values| values.first())
            .unwrap_or(&NULL)
    }

    pub fn input_values(&self, index: usize) -> &[Value] {
        self.inputs
            .get(&index)
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    /// Get required parameter or return error
    pub fn require_parameter(&self, name: &str) -> Result<&Value, NodeError> {
        match self.parameters.get(name) {
            None | Some(Value::Null) => Err(NodeError::MissingParameter(name.to_string())),
            Some(value) => Ok(value),
        }
    }

    pub fn require_str(&self, name: &str) -> Result<&str, NodeError> {
        let value = self.require_parameter(name)?;
        value.as_str().ok_or_else(|| NodeError::InvalidParameter {
            name: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }

    /// Get parameter with default
    pub fn parameter_or(&self, name: &str, default: Value) -> Value {
        match self.parameters.get(name) {
            None | Some(Value::Null) => default,
            Some(value) => value.clone(),
        }
    }

    /// Static data namespace private to this node.
    pub fn node_static_namespace(&self) -> String {
        node_namespace(&self.node_name)
    }

    pub fn node_static_data(&self) -> Map<String, Value> {
        self.static_data.get(&self.node_static_namespace())
    }
}

/// Output from node execution: values keyed by output port.
///
/// A port without an entry emits nothing, so nodes downstream of it see an
/// inactive input. Branching nodes use this to pick a path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub outputs: BTreeMap<usize, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single value on main output 0.
    pub fn main(value: impl Into<Value>) -> Self {
        Self::new().with_output(0, value)
    }

    pub fn with_output(mut self, port: usize, value: impl Into<Value>) -> Self {
        self.outputs.insert(port, value.into());
        self
    }

    pub fn get(&self, port: usize) -> Option<&Value> {
        self.outputs.get(&port)
    }

    /// Value referenced by `$node["Name"].json`.
    pub fn primary(&self) -> Option<&Value> {
        self.outputs.values().next()
    }
}
