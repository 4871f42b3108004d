pub mod integrator;

pub use integrator::{
    create_weight_calculator, GraphIntegrator, IntegrationConfig, ReinjectionPolicy,
    WEIGHT_NODE_PREFIX,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::ai::record::InvocationRecord;
use crate::core::error::{AdaptiveError, AdaptiveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Data,
    Processor,
    Decision,
    Action,
    WeightCalculator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    WeightedDecision,
    Feedback,
}

/// Behavior attached to a graph node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn invoke(&self, record: InvocationRecord) -> AdaptiveResult<InvocationRecord>;
}

#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub metadata: Map<String, Value>,
    handler: Option<Arc<dyn NodeHandler>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("metadata", &self.metadata)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            metadata: Map::new(),
            handler: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn NodeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn handler(&self) -> Option<&Arc<dyn NodeHandler>> {
        self.handler.as_ref()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// Directed node table with typed edges. Node order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.index.get(name).map(|&i| &mut self.nodes[i])
    }

    pub fn add_node(&mut self, node: Node) -> AdaptiveResult<()> {
        if self.contains_node(&node.name) {
            return Err(AdaptiveError::NodeExists(node.name));
        }
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Swaps the node stored under `node.name`, keeping its edges.
    /// Returns the previous node.
    pub fn replace_node(&mut self, node: Node) -> AdaptiveResult<Node> {
        let &i = self
            .index
            .get(&node.name)
            .ok_or_else(|| AdaptiveError::UnknownNode(node.name.clone()))?;
        Ok(std::mem::replace(&mut self.nodes[i], node))
    }

    /// Removes a node together with every edge touching it.
    pub fn remove_node(&mut self, name: &str) -> AdaptiveResult<Node> {
        let i = self
            .index
            .remove(name)
            .ok_or_else(|| AdaptiveError::UnknownNode(name.to_string()))?;
        let node = self.nodes.remove(i);
        for position in self.index.values_mut() {
            if *position > i {
                *position -= 1;
            }
        }
        self.edges.retain(|edge| edge.from != name && edge.to != name);
        Ok(node)
    }

    /// Adds `from -> to`. Re-adding an identical edge is a no-op.
    pub fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) -> AdaptiveResult<()> {
        for name in [from, to] {
            if !self.contains_node(name) {
                return Err(AdaptiveError::UnknownNode(name.to_string()));
            }
        }
        let edge = Edge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.iter().any(|edge| edge.from == from && edge.to == to)
    }

    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|edge| edge.to == name && seen.insert(edge.from.as_str()))
            .map(|edge| edge.from.as_str())
            .collect()
    }

    pub fn successors(&self, name: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|edge| edge.from == name && seen.insert(edge.to.as_str()))
            .map(|edge| edge.to.as_str())
            .collect()
    }

    /// Breadth-first shortest path, `None` when `to` is unreachable.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.contains_node(from) || !self.contains_node(to) {
            return None;
        }

        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut visited = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to.to_string()];
                let mut cursor = to;
                while let Some(&prev) = parent.get(cursor) {
                    path.push(prev.to_string());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.successors(current) {
                if visited.insert(next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Runs the handler attached to `name`. Nodes without a handler hand
    /// the record back unchanged.
    pub async fn invoke(&self, name: &str, record: InvocationRecord) -> AdaptiveResult<InvocationRecord> {
        let node = self
            .node(name)
            .ok_or_else(|| AdaptiveError::UnknownNode(name.to_string()))?;
        match node.handler() {
            Some(handler) => handler.invoke(record).await,
            None => Ok(record),
        }
    }
}
