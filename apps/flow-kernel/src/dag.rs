// apps/flow-kernel/src/dag.rs
// Purpose: DAG structure backing flow validation and scheduling.
// Architecture: Core Data Structure
// Dependencies: std, thiserror

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    /// Names one node on the cycle so the catalog can report "cycle at ...".
    #[error("cycle at {0}")]
    CycleDetected(String),
    #[error("unknown node: {0}")]
    UnknownNode(String),
}

/// Directed graph over node ids. Edges point from a dependency to its
/// dependents, so scheduling walks edge direction.
#[derive(Clone, Debug, Default)]
pub struct FlowGraph {
    nodes: HashSet<String>,
    edges: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node_id: impl Into<String>) {
        self.nodes.insert(node_id.into());
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add an edge `from -> to`. Duplicate edges collapse to one.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if !self.nodes.contains(from) {
            return Err(GraphError::UnknownNode(from.to_string()));
        }
        if !self.nodes.contains(to) {
            return Err(GraphError::UnknownNode(to.to_string()));
        }
        let targets = self.edges.entry(from.to_string()).or_default();
        if !targets.iter().any(|t| t == to) {
            targets.push(to.to_string());
            self.reverse
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        }
        Ok(())
    }

    /// Direct dependents of a node (outgoing edges).
    pub fn dependents(&self, node_id: &str) -> &[String] {
        self.edges.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependencies of a node (incoming edges).
    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.reverse.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn indegree(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .map(|n| (n.clone(), self.dependencies(n).len()))
            .collect()
    }

    /// Kahn's algorithm. Fails naming a node left on a cycle.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree = self.indegree();

        let mut queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| n.clone())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.clone());
            for dependent in self.dependents(&node) {
                let degree = in_degree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent.clone());
                }
            }
        }

        if order.len() != self.nodes.len() {
            let mut stuck: Vec<&String> = in_degree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(n, _)| n)
                .collect();
            stuck.sort();
            return Err(GraphError::CycleDetected(
                stuck.first().map(|s| s.to_string()).unwrap_or_default(),
            ));
        }

        Ok(order)
    }

    /// Topological layers: layer 0 holds roots, layer k nodes whose longest
    /// dependency chain has length k. Nodes within a layer may run in parallel.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let order = self.topological_sort()?;
        let mut depth: HashMap<&str, usize> = HashMap::new();

        for node in &order {
            let d = self
                .dependencies(node)
                .iter()
                .map(|dep| depth.get(dep.as_str()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut layers = vec![Vec::new(); max_depth + 1];
        for node in &order {
            layers[depth[node.as_str()]].push(node.clone());
        }
        for layer in &mut layers {
            layer.sort();
        }
        Ok(layers)
    }

    /// Every node reachable from `start` following edge direction,
    /// including `start` itself.
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for dependent in self.dependents(&node) {
                if !seen.contains(dependent) {
                    stack.push(dependent.clone());
                }
            }
        }
        seen
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.iter()
    }
}
