//! Topological grouping for evaluation order
//!
//! A node is placed in the first group after all of its dependencies have
//! been placed, so every node in group N has its dependencies in groups
//! 0..N-1 and the nodes of one group can be evaluated concurrently.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::{DependencyGraph, NodeId};
use crate::{Error, Result};

/// Nodes that can be evaluated in parallel
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Group {
    /// Node ids in this group, sorted
    pub nodes: Vec<NodeId>,
}

impl Group {
    /// Check if the group is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes in the group
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Ordered groups covering every node in a graph exactly once
#[derive(Clone, Debug)]
pub struct Sequence {
    groups: Vec<Group>,
    total_nodes: usize,
}

impl Sequence {
    /// Compute the sequence using Kahn's algorithm:
    /// 1. Find all unplaced nodes whose dependencies are all placed
    /// 2. Emit them as the next group
    /// 3. Repeat until everything is placed
    ///
    /// Edges to undeclared nodes are reported as unsatisfied rather than
    /// silently ignored.
    pub fn from_graph<T>(graph: &DependencyGraph<T>) -> Result<Self> {
        let all: BTreeSet<&NodeId> = graph.ids().collect();
        let total_nodes = all.len();
        let mut placed: BTreeSet<&NodeId> = BTreeSet::new();
        let mut groups: Vec<Group> = Vec::new();

        while placed.len() < total_nodes {
            let mut group = Group::default();

            for id in &all {
                if placed.contains(id) {
                    continue;
                }
                let mut ready = true;
                for dep in graph.dependencies(id) {
                    if !all.contains(dep) {
                        return Err(Error::dependency_unsatisfied(id.to_string(), dep.to_string()));
                    }
                    if !placed.contains(dep) {
                        ready = false;
                    }
                }
                if ready {
                    group.nodes.push((*id).clone());
                }
            }

            // No progress means the remaining nodes form at least one cycle
            if group.is_empty() {
                let stuck = all
                    .iter()
                    .filter(|id| !placed.contains(*id))
                    .map(|id| id.to_string())
                    .collect();
                return Err(Error::Cycle { nodes: stuck });
            }

            debug!(group = groups.len(), nodes = group.len(), "Computed evaluation group");

            for id in &group.nodes {
                if let Some(original) = all.get(id) {
                    placed.insert(*original);
                }
            }
            groups.push(group);
        }

        info!(
            groups = groups.len(),
            nodes = total_nodes,
            "Computed evaluation sequence"
        );

        Ok(Self {
            groups,
            total_nodes,
        })
    }

    /// The ordered groups
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Total number of nodes across all groups
    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// Number of groups
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Iterate over groups with their index
    pub fn iter_groups(&self) -> impl Iterator<Item = (usize, &Group)> {
        self.groups.iter().enumerate()
    }

    /// All node ids in evaluation order (flattened)
    pub fn all_in_order(&self) -> Vec<NodeId> {
        self.groups
            .iter()
            .flat_map(|g| g.nodes.iter().cloned())
            .collect()
    }

    /// Index of the group containing `id`
    pub fn group_of(&self, id: &NodeId) -> Option<usize> {
        self.groups.iter().position(|g| g.nodes.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use proptest::prelude::*;

    fn id(name: &str) -> NodeId {
        NodeId::new(NodeKind::Secret, name)
    }

    fn build(edges: &[(&str, &[&str])]) -> DependencyGraph<()> {
        let mut graph = DependencyGraph::new();
        for (node, _) in edges {
            graph.add_node(id(node), ()).expect("unique node");
        }
        for (node, deps) in edges {
            for dep in *deps {
                graph.add_edge(&id(node), id(dep)).expect("node exists");
            }
        }
        graph
    }

    #[test]
    fn empty_graph_has_no_groups() {
        let graph: DependencyGraph<()> = DependencyGraph::new();
        let seq = graph.sequence().expect("empty graph sequences");
        assert_eq!(seq.num_groups(), 0);
        assert_eq!(seq.total_nodes(), 0);
    }

    #[test]
    fn independent_nodes_share_a_group() {
        let graph = build(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let seq = graph.sequence().expect("acyclic");
        assert_eq!(seq.num_groups(), 1);
        assert_eq!(seq.groups()[0].len(), 3);
    }

    #[test]
    fn chain_produces_one_group_per_level() {
        let graph = build(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let seq = graph.sequence().expect("acyclic");
        assert_eq!(seq.num_groups(), 3);
        assert_eq!(seq.all_in_order(), vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn diamond_places_join_after_both_branches() {
        let graph = build(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("join", &["left", "right"]),
        ]);
        let seq = graph.sequence().expect("acyclic");
        assert_eq!(seq.num_groups(), 3);
        assert_eq!(seq.group_of(&id("left")), Some(1));
        assert_eq!(seq.group_of(&id("right")), Some(1));
        assert_eq!(seq.group_of(&id("join")), Some(2));
    }

    #[test]
    fn cycles_are_reported_with_stuck_nodes() {
        let graph = build(&[("free", &[]), ("x", &["y"]), ("y", &["x"])]);
        match graph.sequence().expect_err("cycle") {
            Error::Cycle { nodes } => {
                assert_eq!(nodes, vec!["secret/x".to_string(), "secret/y".to_string()]);
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn sequencing_is_deterministic() {
        let edges: &[(&str, &[&str])] = &[
            ("z", &[]),
            ("m", &["z"]),
            ("a", &["z"]),
            ("q", &["a", "m"]),
        ];
        let first = build(edges).sequence().expect("acyclic").all_in_order();
        let second = build(edges).sequence().expect("acyclic").all_in_order();
        assert_eq!(first, second);
        assert_eq!(first, vec![id("z"), id("a"), id("m"), id("q")]);
    }

    proptest! {
        /// Any DAG built by only pointing edges at lower-numbered nodes
        /// sequences with every dependency in an earlier group.
        #[test]
        fn every_dependency_lands_in_an_earlier_group(
            edges in prop::collection::vec((1usize..24, 0usize..24), 0..60)
        ) {
            let mut graph = DependencyGraph::new();
            for n in 0..24 {
                graph.add_node(id(&format!("n{n:02}")), ()).expect("unique");
            }
            for (from, to) in edges {
                let to = to % from;
                graph
                    .add_edge(&id(&format!("n{from:02}")), id(&format!("n{to:02}")))
                    .expect("node exists");
            }

            let seq = graph.sequence().expect("edges only point backwards");
            prop_assert_eq!(seq.total_nodes(), 24);
            prop_assert_eq!(seq.all_in_order().len(), 24);

            for node in graph.ids() {
                let at = seq.group_of(node).expect("every node placed");
                for dep in graph.dependencies(node) {
                    let dep_at = seq.group_of(dep).expect("dependency placed");
                    prop_assert!(dep_at < at, "{} must precede {}", dep, node);
                }
            }
        }
    }
}
