use crate::node::{NodeDescription, NodeTypes};
use crate::static_data::{StaticData, StaticDataSnapshot};
use crate::WorkflowError;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

/// Persisted workflow definition, as handed over by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub static_data: StaticDataSnapshot,
    #[serde(default)]
    pub pin_data: HashMap<String, Value>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Node specification in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: NodeId,
    pub name: String,
    pub node_type: String,
    #[serde(default = "default_type_version")]
    pub type_version: u32,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_type_version() -> u32 {
    1
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            node_type: node_type.into(),
            type_version: 1,
            parameters: Map::new(),
            position: None,
            disabled: false,
            retry_policy: None,
            timeout_ms: None,
            notes: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Parameters as a single JSON value, ready for expression resolution.
    pub fn parameters_value(&self) -> Value {
        Value::Object(self.parameters.clone())
    }
}

/// Kind of edge between two node ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnectionType {
    /// Primary data flow; drives dependency ordering.
    #[default]
    Main,
    /// Taken only when the source node fails.
    Error,
    /// Auxiliary side channel (`ai_tool`, `ai_memory`, ...). Not dispatched.
    Other(String),
}

impl ConnectionType {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionType::Main => "main",
            ConnectionType::Error => "error",
            ConnectionType::Other(name) => name,
        }
    }

    /// Connections that carry data between executed nodes.
    pub fn is_data(&self) -> bool {
        matches!(self, ConnectionType::Main | ConnectionType::Error)
    }
}

impl From<String> for ConnectionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "main" => ConnectionType::Main,
            "error" => ConnectionType::Error,
            _ => ConnectionType::Other(value),
        }
    }
}

impl From<&str> for ConnectionType {
    fn from(value: &str) -> Self {
        ConnectionType::from(value.to_string())
    }
}

impl From<ConnectionType> for String {
    fn from(value: ConnectionType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection between nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    #[serde(default)]
    pub source_output: usize,
    pub destination: String,
    #[serde(default)]
    pub destination_input: usize,
    #[serde(default)]
    pub connection_type: ConnectionType,
}

impl Connection {
    pub fn main(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_output: 0,
            destination: destination.into(),
            destination_input: 0,
            connection_type: ConnectionType::Main,
        }
    }

    pub fn error(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            connection_type: ConnectionType::Error,
            ..Self::main(source, destination)
        }
    }

    pub fn from_output(mut self, output: usize) -> Self {
        self.source_output = output;
        self
    }

    pub fn to_input(mut self, input: usize) -> Self {
        self.destination_input = input;
        self
    }

    pub fn of_type(mut self, connection_type: impl Into<ConnectionType>) -> Self {
        self.connection_type = connection_type.into();
        self
    }
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1).min(20) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub timezone: String,
    pub max_parallel_nodes: usize,
    pub node_timeout_ms: Option<u64>,
    pub execution_timeout_ms: Option<u64>,
    pub on_error: ErrorHandling,
    pub save_static_data: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            max_parallel_nodes: 10,
            node_timeout_ms: None,
            execution_timeout_ms: None,
            on_error: ErrorHandling::ContinueOnError,
            save_static_data: true,
        }
    }
}

/// What happens to the rest of a run when a node fails without an error
/// output to route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorHandling {
    /// Stop dispatching anything new.
    StopWorkflow,
    /// Keep running branches that do not depend on the failed node.
    #[default]
    ContinueOnError,
}

/// The in-memory workflow graph.
///
/// Connections are stored once, in definition order. `by_source` and
/// `by_destination` hold positions into that list and are rebuilt from it
/// after every structural change, so they can never disagree.
///
/// Cloning copies the static data store; the clone and the original never
/// see each other's writes.
#[derive(Debug)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub active: bool,
    pub settings: WorkflowSettings,
    /// Owning user, looked up elsewhere for authorization.
    pub owner_id: Option<String>,
    pub(crate) nodes: HashMap<String, NodeSpec>,
    pub(crate) order: Vec<String>,
    pub(crate) connections: Vec<Connection>,
    pub(crate) by_source: HashMap<String, Vec<usize>>,
    pub(crate) by_destination: HashMap<String, Vec<usize>>,
    pub(crate) static_data: StaticData,
    pub(crate) pin_data: HashMap<String, Value>,
}

impl Clone for Workflow {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
            settings: self.settings.clone(),
            owner_id: self.owner_id.clone(),
            nodes: self.nodes.clone(),
            order: self.order.clone(),
            connections: self.connections.clone(),
            by_source: self.by_source.clone(),
            by_destination: self.by_destination.clone(),
            static_data: StaticData::from_snapshot(self.static_data.snapshot()),
            pin_data: self.pin_data.clone(),
        }
    }
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            active: false,
            settings: WorkflowSettings::default(),
            owner_id: None,
            nodes: HashMap::new(),
            order: Vec::new(),
            connections: Vec::new(),
            by_source: HashMap::new(),
            by_destination: HashMap::new(),
            static_data: StaticData::new(),
            pin_data: HashMap::new(),
        }
    }

    /// Build and validate a workflow from its persisted form.
    pub fn from_definition(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        let mut workflow = Self::new(definition.name);
        workflow.id = definition.id;
        workflow.active = definition.active;
        workflow.settings = definition.settings;
        workflow.owner_id = definition.owner_id;
        workflow.static_data = StaticData::from_snapshot(definition.static_data);

        for node in definition.nodes {
            workflow.insert_node(node)?;
        }
        workflow.connections = definition.connections;
        workflow.pin_data = definition.pin_data;
        workflow.reindex();
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn to_definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            id: self.id,
            name: self.name.clone(),
            active: self.active,
            nodes: self.nodes().cloned().collect(),
            connections: self.connections.clone(),
            settings: self.settings.clone(),
            static_data: self.static_data.snapshot(),
            pin_data: self.pin_data.clone(),
            owner_id: self.owner_id.clone(),
        }
    }

    /// Check every structural invariant: unique names and ids, no dangling
    /// connections, no cycle through data connections.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut ids = HashSet::new();
        for node in self.nodes() {
            if node.name.trim().is_empty() {
                return Err(WorkflowError::InvalidDefinition(
                    "node with an empty name".to_string(),
                ));
            }
            if !ids.insert(node.id) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        for conn in &self.connections {
            for endpoint in [&conn.source, &conn.destination] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "connection {} -> {} references unknown node '{}'",
                        conn.source, conn.destination, endpoint
                    )));
                }
            }
        }

        for name in self.pin_data.keys() {
            if !self.nodes.contains_key(name) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "pinned data for unknown node '{}'",
                    name
                )));
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), WorkflowError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index = HashMap::new();
        for name in &self.order {
            index.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for conn in self.connections.iter().filter(|c| c.connection_type.is_data()) {
            if let (Some(&from), Some(&to)) = (
                index.get(conn.source.as_str()),
                index.get(conn.destination.as_str()),
            ) {
                graph.add_edge(from, to, ());
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            WorkflowError::InvalidDefinition(format!(
                "cycle detected through node '{}'",
                graph[cycle.node_id()]
            ))
        })
    }

    fn insert_node(&mut self, node: NodeSpec) -> Result<NodeId, WorkflowError> {
        if self.nodes.contains_key(&node.name) {
            return Err(WorkflowError::InvalidDefinition(format!(
                "duplicate node name '{}'",
                node.name
            )));
        }
        let id = node.id;
        self.order.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
        Ok(id)
    }

    pub fn add_node(&mut self, node: NodeSpec) -> Result<NodeId, WorkflowError> {
        if node.name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "node with an empty name".to_string(),
            ));
        }
        if self.nodes.values().any(|n| n.id == node.id) {
            return Err(WorkflowError::InvalidDefinition(format!(
                "duplicate node id {}",
                node.id
            )));
        }
        self.insert_node(node)
    }

    /// Remove a node together with every connection touching it.
    pub fn remove_node(&mut self, name: &str) -> Result<NodeSpec, WorkflowError> {
        let node = self
            .nodes
            .remove(name)
            .ok_or_else(|| WorkflowError::NodeNotFound(name.to_string()))?;
        self.order.retain(|n| n != name);
        self.connections
            .retain(|c| c.source != name && c.destination != name);
        self.pin_data.remove(name);
        self.reindex();
        Ok(node)
    }

    /// Connect main output 0 of `from` to main input 0 of `to`.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), WorkflowError> {
        self.add_connection(Connection::main(from, to))
    }

    pub fn add_connection(&mut self, connection: Connection) -> Result<(), WorkflowError> {
        for endpoint in [&connection.source, &connection.destination] {
            if !self.nodes.contains_key(endpoint) {
                return Err(WorkflowError::NodeNotFound(endpoint.clone()));
            }
        }
        if self.connections.contains(&connection) {
            return Ok(());
        }

        self.connections.push(connection);
        if let Err(e) = self.check_acyclic() {
            self.connections.pop();
            return Err(e);
        }
        self.reindex();
        Ok(())
    }

    pub fn remove_connection(&mut self, connection: &Connection) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c != connection);
        let removed = self.connections.len() != before;
        if removed {
            self.reindex();
        }
        removed
    }

    /// Derive both connection indexes from the canonical list.
    pub(crate) fn reindex(&mut self) {
        self.by_source.clear();
        self.by_destination.clear();
        for (position, conn) in self.connections.iter().enumerate() {
            self.by_source
                .entry(conn.source.clone())
                .or_default()
                .push(position);
            self.by_destination
                .entry(conn.destination.clone())
                .or_default()
                .push(position);
        }
    }

    pub fn get_node(&self, name: &str) -> Result<&NodeSpec, WorkflowError> {
        self.nodes
            .get(name)
            .ok_or_else(|| WorkflowError::NodeNotFound(name.to_string()))
    }

    pub fn get_node_mut(&mut self, name: &str) -> Result<&mut NodeSpec, WorkflowError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| WorkflowError::NodeNotFound(name.to_string()))
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Nodes whose type description satisfies `predicate`. Nodes of types the
    /// lookup does not know are ignored.
    pub fn nodes_matching<F>(&self, types: &dyn NodeTypes, predicate: F) -> Vec<&NodeSpec>
    where
        F: Fn(&NodeDescription) -> bool,
    {
        self.nodes()
            .filter(|node| {
                types
                    .description(&node.node_type)
                    .map(|desc| predicate(&desc))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connections_by_source<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.indexed(&self.by_source, name)
    }

    pub fn connections_by_destination<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.indexed(&self.by_destination, name)
    }

    fn indexed<'a>(
        &'a self,
        index: &'a HashMap<String, Vec<usize>>,
        name: &str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        index
            .get(name)
            .map(|positions| positions.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&position| &self.connections[position])
    }

    /// Data-connection topological order, ties broken by definition order.
    pub fn topological_order(&self) -> Result<Vec<String>, WorkflowError> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut in_degree: HashMap<&str, usize> =
            self.order.iter().map(|n| (n.as_str(), 0)).collect();
        for conn in self.connections.iter().filter(|c| c.connection_type.is_data()) {
            if let Some(degree) = in_degree.get_mut(conn.destination.as_str()) {
                *degree += 1;
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| position[*name])
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(next) = ready.pop_first() {
            let name = &self.order[next];
            sorted.push(name.clone());
            for conn in self
                .connections_by_source(name)
                .filter(|c| c.connection_type.is_data())
            {
                if let Some(degree) = in_degree.get_mut(conn.destination.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(position[conn.destination.as_str()]);
                    }
                }
            }
        }

        if sorted.len() < self.order.len() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow contains a cycle".to_string(),
            ));
        }
        Ok(sorted)
    }

    pub fn static_data(&self) -> &StaticData {
        &self.static_data
    }

    pub fn get_static_data(&self, namespace: &str) -> Map<String, Value> {
        self.static_data.get(namespace)
    }

    /// Merge `values` into a namespace; namespaces not named stay untouched.
    pub fn set_static_data(&self, namespace: &str, values: Map<String, Value>) {
        self.static_data.merge(namespace, values);
    }

    pub fn get_pin_data(&self, name: &str) -> Option<&Value> {
        self.pin_data.get(name)
    }

    pub fn pin_data(&self) -> &HashMap<String, Value> {
        &self.pin_data
    }

    pub fn set_pin_data(&mut self, name: &str, data: Value) -> Result<(), WorkflowError> {
        if !self.nodes.contains_key(name) {
            return Err(WorkflowError::NodeNotFound(name.to_string()));
        }
        self.pin_data.insert(name.to_string(), data);
        Ok(())
    }

    pub fn clear_pin_data(&mut self, name: &str) -> Option<Value> {
        self.pin_data.remove(name)
    }
}
