//! Directed Acyclic Graph (DAG) for task dependency management.
//!
//! Used at workflow-parse time to reject cyclic task graphs and to compute
//! a deterministic topological order of tasks.
//!
//! **Note:** This module is internal to `weft-engine` to preserve freedom to
//! change internals.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed acyclic graph with deterministic topological sorting.
///
/// `petgraph` assigns node indices in insertion order, so a min-heap over
/// the ready set makes Kahn's algorithm deterministic: whenever several
/// nodes are ready at once, the earliest-inserted one sorts first.
#[derive(Debug, Clone)]
pub(crate) struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    pub(crate) fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
        }
    }

    /// Adds a node; a no-op when the node already exists.
    pub(crate) fn add_node(&mut self, value: T) -> NodeIndex {
        match self.index_map.get(&value) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(value.clone());
                self.index_map.insert(value, idx);
                idx
            }
        }
    }

    /// Adds a directed edge from `from` to `to`.
    pub(crate) fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        if self.graph.node_weight(from).is_none() || self.graph.node_weight(to).is_none() {
            return Err(Error::internal(format!(
                "edge references unknown DAG node ({} -> {})",
                from.index(),
                to.index()
            )));
        }
        self.graph.add_edge(from, to, ());
        Ok(())
    }

    /// Returns a topologically sorted list of nodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the graph contains a cycle.
    pub(crate) fn toposort(&self) -> Result<Vec<T>> {
        let mut remaining_deps: Vec<usize> = vec![0; self.graph.node_count()];
        for edge in self.graph.edge_references() {
            remaining_deps[edge.target().index()] += 1;
        }

        // Min-heap over node indices: ready nodes pop in insertion order.
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = remaining_deps
            .iter()
            .enumerate()
            .filter(|(_, deps)| **deps == 0)
            .map(|(i, _)| Reverse(NodeIndex::new(i)))
            .collect();

        let mut sorted = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = ready.pop() {
            if let Some(value) = self.graph.node_weight(idx) {
                sorted.push(value.clone());
            }
            for neighbor in self.graph.neighbors(idx) {
                if let Some(deps) = remaining_deps.get_mut(neighbor.index()) {
                    *deps = deps.saturating_sub(1);
                    if *deps == 0 {
                        ready.push(Reverse(neighbor));
                    }
                }
            }
        }

        if sorted.len() < self.graph.node_count() {
            // Some node still waits on a dependency: name one of them.
            let stuck = remaining_deps
                .iter()
                .position(|deps| *deps > 0)
                .and_then(|i| self.graph.node_weight(NodeIndex::new(i)))
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            return Err(Error::validation(format!(
                "cycle detected in task graph involving '{stuck}'"
            )));
        }

        Ok(sorted)
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dag_sorts_to_nothing() {
        let dag: Dag<String> = Dag::new();
        assert!(dag.toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_dag_sorts_in_order() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        dag.add_edge(a, b).unwrap();
        dag.add_edge(b, c).unwrap();

        assert_eq!(dag.toposort().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut dag: Dag<String> = Dag::new();
        let b = dag.add_node("b".into());
        let a = dag.add_node("a".into());
        let c = dag.add_node("c".into());
        dag.add_edge(a, c).unwrap();
        dag.add_edge(b, c).unwrap();

        assert_eq!(dag.toposort().unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn diamond_sorts_deterministically() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        let d = dag.add_node("d".into());
        dag.add_edge(a, b).unwrap();
        dag.add_edge(a, c).unwrap();
        dag.add_edge(b, d).unwrap();
        dag.add_edge(c, d).unwrap();

        let first = dag.toposort().unwrap();
        assert_eq!(first, vec!["a", "b", "c", "d"]);
        assert_eq!(dag.toposort().unwrap(), first);
    }

    #[test]
    fn cycles_are_detected() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        dag.add_edge(a, b).unwrap();
        dag.add_edge(b, a).unwrap();

        assert!(matches!(dag.toposort(), Err(Error::Validation { .. })));
    }

    #[test]
    fn duplicate_nodes_are_deduplicated() {
        let mut dag: Dag<String> = Dag::new();
        let first = dag.add_node("a".into());
        let second = dag.add_node("a".into());
        assert_eq!(first, second);
    }
}
