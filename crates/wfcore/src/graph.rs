//! Traversal and editing algorithms over a [`Workflow`].
//!
//! Every walk keeps a visited set, so diamonds report a node once and a
//! cycle through auxiliary connections still terminates.

use crate::node::NodeTypes;
use crate::static_data::node_namespace;
use crate::workflow::{ConnectionType, NodeSpec, Workflow};
use crate::WorkflowError;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Which connection types a traversal follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFilter {
    All,
    /// Every type except `main`; `error` counts as non-main.
    AllNonMain,
    Only(ConnectionType),
}

impl ConnectionFilter {
    pub fn main() -> Self {
        Self::Only(ConnectionType::Main)
    }

    pub fn matches(&self, connection_type: &ConnectionType) -> bool {
        match self {
            ConnectionFilter::All => true,
            ConnectionFilter::AllNonMain => *connection_type != ConnectionType::Main,
            ConnectionFilter::Only(only) => only == connection_type,
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

impl Workflow {
    /// Ancestors of `name`, nearest first. `depth` bounds the number of hops.
    pub fn get_parent_nodes(
        &self,
        name: &str,
        filter: &ConnectionFilter,
        depth: Option<usize>,
    ) -> Vec<String> {
        self.walk(name, Direction::Upstream, depth, |t| filter.matches(t))
    }

    /// Descendants of `name`, nearest first. `depth` bounds the number of hops.
    pub fn get_child_nodes(
        &self,
        name: &str,
        filter: &ConnectionFilter,
        depth: Option<usize>,
    ) -> Vec<String> {
        self.walk(name, Direction::Downstream, depth, |t| filter.matches(t))
    }

    /// Nodes reachable downstream through `main` and `error` connections.
    pub fn data_descendants(&self, name: &str) -> HashSet<String> {
        self.walk(name, Direction::Downstream, None, ConnectionType::is_data)
            .into_iter()
            .collect()
    }

    /// Nodes reaching `name` through `main` and `error` connections.
    pub fn data_ancestors(&self, name: &str) -> HashSet<String> {
        self.walk(name, Direction::Upstream, None, ConnectionType::is_data)
            .into_iter()
            .collect()
    }

    fn walk<F>(&self, start: &str, direction: Direction, depth: Option<usize>, follow: F) -> Vec<String>
    where
        F: Fn(&ConnectionType) -> bool,
    {
        let mut found = Vec::new();
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(start, 0)]);

        while let Some((current, level)) = queue.pop_front() {
            if depth.is_some_and(|max| level >= max) {
                continue;
            }
            let neighbours: Box<dyn Iterator<Item = &str>> = match direction {
                Direction::Upstream => Box::new(
                    self.connections_by_destination(current)
                        .filter(|c| follow(&c.connection_type))
                        .map(|c| c.source.as_str()),
                ),
                Direction::Downstream => Box::new(
                    self.connections_by_source(current)
                        .filter(|c| follow(&c.connection_type))
                        .map(|c| c.destination.as_str()),
                ),
            };
            for next in neighbours {
                if visited.insert(next) {
                    found.push(next.to_string());
                    queue.push_back((next, level + 1));
                }
            }
        }

        found
    }

    /// Topmost enabled ancestors of `name` along `main` connections.
    ///
    /// Empty when `name` has no enabled `main` parents. `input_index`
    /// restricts the first hop to one input of `name`. `visited` is shared
    /// across the recursion and may be pre-seeded by the caller.
    pub fn get_highest_node(
        &self,
        name: &str,
        input_index: Option<usize>,
        visited: &mut HashSet<String>,
    ) -> Vec<String> {
        let mut highest = Vec::new();
        if !visited.insert(name.to_string()) {
            return highest;
        }

        let parents: Vec<&str> = self
            .enabled_main_parents(name)
            .filter(|(_, input)| input_index.map_or(true, |i| i == *input))
            .map(|(parent, _)| parent)
            .collect();

        for parent in parents {
            let mut from_parent = self.get_highest_node(parent, None, visited);
            // An already visited parent with parents of its own has had its
            // roots collected through another path.
            if from_parent.is_empty() && self.enabled_main_parents(parent).next().is_none() {
                from_parent.push(parent.to_string());
            }
            for node in from_parent {
                if !highest.contains(&node) {
                    highest.push(node);
                }
            }
        }

        highest
    }

    fn enabled_main_parents<'a>(&'a self, name: &str) -> impl Iterator<Item = (&'a str, usize)> + 'a {
        self.connections_by_destination(name)
            .filter(|c| c.connection_type == ConnectionType::Main)
            .filter(|c| self.nodes.get(&c.source).is_some_and(|n| !n.disabled))
            .map(|c| (c.source.as_str(), c.destination_input))
    }

    /// The node that actually receives main input on behalf of `name`.
    ///
    /// Sub-nodes that only feed a parent through auxiliary connections
    /// (tools, memories, models) resolve to that parent, recursively.
    pub fn get_parent_main_input_node(&self, name: &str) -> Result<&NodeSpec, WorkflowError> {
        let mut current = self.get_node(name)?;
        let mut visited = HashSet::from([current.name.as_str()]);

        while let Some(conn) = self
            .connections_by_source(&current.name)
            .find(|c| matches!(c.connection_type, ConnectionType::Other(_)))
        {
            if !visited.insert(conn.destination.as_str()) {
                break;
            }
            current = self.get_node(&conn.destination)?;
        }

        Ok(current)
    }

    /// Pick the node a run starts from.
    ///
    /// With a destination, candidates are the highest ancestors of the node
    /// that consumes its main input. Without, every node is a candidate.
    /// Preference among enabled candidates, each in definition order:
    /// trigger types, poll types, types without inputs, nodes without data
    /// parents, and finally the destination itself.
    pub fn get_start_node(
        &self,
        types: &dyn NodeTypes,
        destination: Option<&str>,
    ) -> Result<&NodeSpec, WorkflowError> {
        let (candidates, fallback) = match destination {
            Some(destination) => {
                let resolved = self.get_parent_main_input_node(destination)?;
                let mut highest = self.get_highest_node(&resolved.name, None, &mut HashSet::new());
                if highest.is_empty() {
                    highest.push(resolved.name.clone());
                }
                if highest.len() == 1 {
                    let only = self.get_node(&highest[0])?;
                    return if only.disabled {
                        Err(WorkflowError::NoStartNode)
                    } else {
                        Ok(only)
                    };
                }
                (highest, Some(resolved))
            }
            None => (self.order.clone(), None),
        };

        let enabled: Vec<&NodeSpec> = self
            .nodes()
            .filter(|node| candidates.contains(&node.name) && !node.disabled)
            .collect();
        let described = |node: &NodeSpec, test: &dyn Fn(&crate::NodeDescription) -> bool| {
            types
                .description(&node.node_type)
                .is_some_and(|desc| test(&desc))
        };

        enabled
            .iter()
            .find(|node| described(node, &|d| d.is_trigger()))
            .or_else(|| enabled.iter().find(|node| described(node, &|d| d.is_poll())))
            .or_else(|| enabled.iter().find(|node| described(node, &|d| d.inputs.is_empty())))
            .or_else(|| {
                enabled.iter().find(|node| {
                    !self
                        .connections_by_destination(&node.name)
                        .any(|c| c.connection_type.is_data())
                })
            })
            .copied()
            .or(fallback.filter(|node| !node.disabled))
            .ok_or(WorkflowError::NoStartNode)
    }

    /// Rename a node and every reference to it.
    ///
    /// Updates the node table, connections, pinned data, the node's static
    /// data namespace and `$node[...]` style references inside `{{ }}`
    /// expressions of every node. Renaming to the current name, or
    /// re-applying a rename that already happened, is a no-op.
    pub fn rename_node(&mut self, old: &str, new: &str) -> Result<(), WorkflowError> {
        match (self.contains_node(old), self.contains_node(new)) {
            _ if old == new => return self.get_node(old).map(|_| ()),
            (false, true) => return Ok(()),
            (false, false) => return Err(WorkflowError::NodeNotFound(old.to_string())),
            (true, true) => {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "cannot rename '{}': a node named '{}' already exists",
                    old, new
                )))
            }
            (true, false) => {}
        }
        if new.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "node with an empty name".to_string(),
            ));
        }
        let renamer = ReferenceRenamer::new(old, new)?;
        tracing::debug!("Renaming node '{}' to '{}'", old, new);

        let mut node = self
            .nodes
            .remove(old)
            .ok_or_else(|| WorkflowError::NodeNotFound(old.to_string()))?;
        node.name = new.to_string();
        self.nodes.insert(new.to_string(), node);

        for name in self.order.iter_mut().filter(|n| n.as_str() == old) {
            *name = new.to_string();
        }
        for conn in &mut self.connections {
            if conn.source == old {
                conn.source = new.to_string();
            }
            if conn.destination == old {
                conn.destination = new.to_string();
            }
        }
        if let Some(pinned) = self.pin_data.remove(old) {
            self.pin_data.insert(new.to_string(), pinned);
        }
        self.static_data
            .rename_namespace(&node_namespace(old), &node_namespace(new));

        for node in self.nodes.values_mut() {
            for value in node.parameters.values_mut() {
                renamer.rewrite(value);
            }
        }

        self.reindex();
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Rewrites node references inside `{{ }}` blocks.
struct ReferenceRenamer {
    block: Regex,
    quoted: Vec<(Regex, char)>,
    dotted: Option<Regex>,
    new: String,
}

impl ReferenceRenamer {
    fn new(old: &str, new: &str) -> Result<Self, WorkflowError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))
        };
        let escaped = regex::escape(old);
        let quoted = ['"', '\'']
            .into_iter()
            .map(|quote| {
                let pattern = format!(r"(\$node\[\s*|\$\(\s*){q}{name}{q}", q = quote, name = escaped);
                compile(&pattern).map(|re| (re, quote))
            })
            .collect::<Result<_, _>>()?;
        let dotted = if is_identifier(old) {
            Some(compile(&format!(r"\$node\.{}([^A-Za-z0-9_]|$)", escaped))?)
        } else {
            None
        };

        Ok(Self {
            block: compile(r"(?s)\{\{(.*?)\}\}")?,
            quoted,
            dotted,
            new: new.to_string(),
        })
    }

    fn rewrite(&self, value: &mut Value) {
        match value {
            Value::String(text) if text.contains("{{") => {
                let rewritten = self
                    .block
                    .replace_all(text, |caps: &Captures| format!("{{{{{}}}}}", self.rewrite_expression(&caps[1])))
                    .into_owned();
                *text = rewritten;
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.rewrite(item)),
            Value::Object(map) => map.values_mut().for_each(|item| self.rewrite(item)),
            _ => {}
        }
    }

    fn rewrite_expression(&self, expression: &str) -> String {
        let mut result = expression.to_string();
        for (pattern, quote) in &self.quoted {
            result = pattern
                .replace_all(&result, |caps: &Captures| {
                    format!("{}{q}{}{q}", &caps[1], self.new, q = quote)
                })
                .into_owned();
        }
        if let Some(dotted) = &self.dotted {
            result = dotted
                .replace_all(&result, |caps: &Captures| {
                    if is_identifier(&self.new) {
                        format!("$node.{}{}", self.new, &caps[1])
                    } else {
                        format!("$node[\"{}\"]{}", self.new, &caps[1])
                    }
                })
                .into_owned();
        }
        result
    }
}
