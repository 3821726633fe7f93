use crate::value::merge_maps;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const GLOBAL_NAMESPACE: &str = "global";

/// Namespace holding the private state of a single node.
pub fn node_namespace(node_name: &str) -> String {
    format!("node:{}", node_name)
}

pub type StaticDataSnapshot = HashMap<String, Map<String, Value>>;

/// Workflow-scoped state that outlives a single run (polling cursors and the
/// like). Cloning yields another handle to the same store; use
/// [`StaticData::from_snapshot`] for an independent copy.
///
/// Writers are serialized by the write lock; readers never block each other.
#[derive(Debug, Clone, Default)]
pub struct StaticData {
    inner: Arc<StaticDataInner>,
}

#[derive(Debug, Default)]
struct StaticDataInner {
    namespaces: RwLock<StaticDataSnapshot>,
    version: AtomicU64,
}

impl StaticData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StaticDataSnapshot) -> Self {
        Self {
            inner: Arc::new(StaticDataInner {
                namespaces: RwLock::new(snapshot),
                version: AtomicU64::new(0),
            }),
        }
    }

    /// Copy of one namespace; an empty object when it does not exist.
    pub fn get(&self, namespace: &str) -> Map<String, Value> {
        self.inner
            .namespaces
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Merge `values` into `namespace`, creating it if needed. Other
    /// namespaces are left alone.
    pub fn merge(&self, namespace: &str, values: Map<String, Value>) {
        let mut namespaces = self.inner.namespaces.write();
        let target = namespaces.entry(namespace.to_string()).or_default();
        merge_maps(target, values);
        self.inner.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Mutate a namespace in place under the write lock.
    pub fn update<R>(&self, namespace: &str, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut namespaces = self.inner.namespaces.write();
        let target = namespaces.entry(namespace.to_string()).or_default();
        let result = f(target);
        self.inner.version.fetch_add(1, Ordering::SeqCst);
        result
    }

    pub(crate) fn rename_namespace(&self, from: &str, to: &str) {
        let mut namespaces = self.inner.namespaces.write();
        if let Some(values) = namespaces.remove(from) {
            namespaces.insert(to.to_string(), values);
            self.inner.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> StaticDataSnapshot {
        self.inner.namespaces.read().clone()
    }

    /// Monotonic counter bumped on every write. Lets a run tell whether it
    /// changed anything worth persisting.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }
}
