use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use wfcore::{NodeDescription, NodeType, NodeTypes, WorkflowError};

static GLOBAL: OnceLock<Arc<NodeRegistry>> = OnceLock::new();

/// Registry of available node types.
///
/// Filled once at startup, then frozen behind an `Arc` and only read.
pub struct NodeRegistry {
    types: HashMap<String, Arc<dyn NodeType>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register a node type under `type_name`.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        node_type: Arc<dyn NodeType>,
    ) -> Result<(), WorkflowError> {
        let type_name = type_name.into();
        if self.types.contains_key(&type_name) {
            return Err(WorkflowError::DuplicateType(type_name));
        }
        tracing::info!("Registering node type: {}", type_name);
        self.types.insert(type_name, node_type);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn NodeType>, WorkflowError> {
        self.types
            .get(type_name)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Get all registered node types, sorted by name
    pub fn list_node_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn describe(&self, type_name: &str) -> Result<NodeDescription, WorkflowError> {
        self.get(type_name).map(|node_type| node_type.describe())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Freeze the registry and make it available process-wide. Returns the
    /// already installed registry if another caller got there first.
    pub fn install_global(self) -> Arc<NodeRegistry> {
        let registry = Arc::new(self);
        GLOBAL.get_or_init(|| registry).clone()
    }

    pub fn global() -> Option<Arc<NodeRegistry>> {
        GLOBAL.get().cloned()
    }
}

impl NodeTypes for NodeRegistry {
    fn description(&self, type_name: &str) -> Option<NodeDescription> {
        self.types.get(type_name).map(|node_type| node_type.describe())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
