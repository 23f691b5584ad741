//! The desired-state graph.
//!
//! Nodes live in an arena indexed by logical id. Edges point from the
//! dependent to the dependency and are only ever built by
//! [`GraphBuilder`](super::GraphBuilder), which rejects cycles.

use std::collections::{BTreeSet, HashMap};

use super::node::{DependencyEdge, NodeStatus, ResourceNode};

/// A validated, acyclic set of resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    edges: Vec<DependencyEdge>,
}

impl ResourceGraph {
    /// Creates a graph with no resources, the desired state of a teardown.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(nodes: Vec<ResourceNode>, edges: Vec<DependencyEdge>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();
        Self {
            nodes,
            index,
            edges,
        }
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Looks up a node mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ResourceNode> {
        self.index.get(id).map(|&i| &mut self.nodes[i])
    }

    /// Returns true if the id is declared.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Iterates over nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// All edges.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Distinct dependencies of a node, sorted.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct dependents of a node, sorted.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Properties of `from` that reference `to`.
    #[must_use]
    pub fn referencing_properties(&self, from: &str, to: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == from && e.to == to)
            .map(|e| e.property.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Node ids with dependencies before dependents. Ties break by id.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        let mut remaining: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), self.dependencies_of(&n.id).len()))
            .collect();

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for dependent in self.dependents_of(id) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }

    /// Sets a node's status. Returns false if the id is unknown.
    pub fn set_status(&mut self, id: &str, status: NodeStatus) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Properties;

    fn edge(from: &str, to: &str, property: &str) -> DependencyEdge {
        DependencyEdge {
            from: from.into(),
            to: to.into(),
            property: property.into(),
        }
    }

    fn graph() -> ResourceGraph {
        let nodes = ["api", "fn", "table", "bucket"]
            .iter()
            .map(|id| ResourceNode::new(*id, "Thing", Properties::new()))
            .collect();
        ResourceGraph::from_parts(
            nodes,
            vec![
                edge("api", "fn", "handler"),
                edge("fn", "table", "env"),
                edge("fn", "bucket", "env"),
                edge("fn", "bucket", "policy"),
            ],
        )
    }

    #[test]
    fn test_topological_order() {
        let graph = graph();
        assert_eq!(graph.topological_order(), vec!["bucket", "table", "fn", "api"]);
    }

    #[test]
    fn test_neighbours() {
        let graph = graph();
        assert_eq!(graph.dependencies_of("fn"), vec!["bucket", "table"]);
        assert_eq!(graph.dependents_of("bucket"), vec!["fn"]);
        assert_eq!(
            graph.referencing_properties("fn", "bucket"),
            vec!["env", "policy"]
        );
    }

    #[test]
    fn test_set_status() {
        let mut graph = graph();
        assert!(graph.set_status("api", NodeStatus::Planned));
        assert_eq!(graph.get("api").map(|n| n.status), Some(NodeStatus::Planned));
        assert!(!graph.set_status("missing", NodeStatus::Planned));
    }
}
