//! Resource dependency graph
//!
//! Every resource the platform creates is a node; every "must exist before"
//! relationship is an edge from the dependent node to its dependency. The
//! graph is built once from the component declarations, validated, and then
//! grouped into a [`Sequence`] for evaluation.
//!
//! The graph is generic over its payload so the component crates can declare
//! nodes without knowing what the evaluator stores for them.

mod sequence;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use sequence::{Group, Sequence};

/// Kind of resource a node stands for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// Secret record in the secret store
    Secret,
    /// Managed cluster with its worker capacity
    Cluster,
    /// Cloud identity bound to a Kubernetes service account
    Identity,
    /// Chart-installed supporting controller
    Controller,
    /// Network scope that admits cluster traffic to the database
    DatabaseNetworkRule,
    /// Managed document database
    Database,
    /// Kubernetes namespace
    Namespace,
    /// Secret-sync binding of one record into one namespace
    SecretBinding,
    /// Deployment + Service pair
    Workload,
    /// Ingress routing table
    Routing,
    /// Namespace network policy
    NetworkPolicy,
}

impl NodeKind {
    /// Stable string form used in node ids and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Secret => "secret",
            NodeKind::Cluster => "cluster",
            NodeKind::Identity => "identity",
            NodeKind::Controller => "controller",
            NodeKind::DatabaseNetworkRule => "database-network-rule",
            NodeKind::Database => "database",
            NodeKind::Namespace => "namespace",
            NodeKind::SecretBinding => "binding",
            NodeKind::Workload => "workload",
            NodeKind::Routing => "routing",
            NodeKind::NetworkPolicy => "network-policy",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a node: its kind plus a name unique within that kind
///
/// Namespaced resources use `namespace/name` as their name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Resource kind
    pub kind: NodeKind,
    /// Name, unique per kind
    pub name: String,
}

impl NodeId {
    /// Create a node id
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Create a node id for a namespaced resource
    pub fn namespaced(kind: NodeKind, namespace: &str, name: &str) -> Self {
        Self::new(kind, format!("{}/{}", namespace, name))
    }

    /// Node id of a secret record
    pub fn secret(logical_name: &str) -> Self {
        Self::new(NodeKind::Secret, logical_name)
    }

    /// Node id of a cluster
    pub fn cluster(name: &str) -> Self {
        Self::new(NodeKind::Cluster, name)
    }

    /// Node id of a controller
    pub fn controller(name: &str) -> Self {
        Self::new(NodeKind::Controller, name)
    }

    /// Node id of a namespace
    pub fn namespace(name: &str) -> Self {
        Self::new(NodeKind::Namespace, name)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Something that becomes a node in the dependency graph
pub trait Declaration {
    /// The node this declaration occupies
    fn node_id(&self) -> NodeId;

    /// Nodes that must be complete before this one is evaluated
    fn dependencies(&self) -> Vec<NodeId>;
}

/// Directed acyclic graph of resources
///
/// Edges point from a node to the nodes it depends on. Ordered maps keep
/// iteration, sequencing and rendering deterministic for identical input.
#[derive(Clone, Debug)]
pub struct DependencyGraph<T> {
    nodes: BTreeMap<NodeId, T>,
    /// node -> nodes it depends on
    dependencies: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// node -> nodes that depend on it
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DependencyGraph<T> {
    /// Create an empty graph
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dependents: BTreeMap::new(),
        }
    }

    /// Add a node. Declaring the same id twice is a configuration error.
    pub fn add_node(&mut self, id: NodeId, payload: T) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::configuration(
                "graph",
                format!("node {} declared twice", id),
            ));
        }
        self.dependencies.entry(id.clone()).or_default();
        self.dependents.entry(id.clone()).or_default();
        self.nodes.insert(id, payload);
        Ok(())
    }

    /// Add a declaration as a node together with its declared dependencies
    pub fn add_declaration<D>(&mut self, declaration: &D, payload: T) -> Result<()>
    where
        D: Declaration,
    {
        let id = declaration.node_id();
        self.add_node(id.clone(), payload)?;
        for dep in declaration.dependencies() {
            self.add_edge(&id, dep)?;
        }
        Ok(())
    }

    /// Record that `node` depends on `depends_on`
    ///
    /// The dependency may be declared later; [`validate`](Self::validate)
    /// rejects edges whose target never appears.
    pub fn add_edge(&mut self, node: &NodeId, depends_on: NodeId) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(Error::dependency_unsatisfied(
                node.to_string(),
                format!("{} (edge declared before its node)", depends_on),
            ));
        }
        if *node == depends_on {
            return Err(Error::Cycle {
                nodes: vec![node.to_string()],
            });
        }
        self.dependents
            .entry(depends_on.clone())
            .or_default()
            .insert(node.clone());
        self.dependencies
            .entry(node.clone())
            .or_default()
            .insert(depends_on);
        Ok(())
    }

    /// Get a node's payload
    pub fn get(&self, id: &NodeId) -> Option<&T> {
        self.nodes.get(id)
    }

    /// Whether a node is declared
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of declared nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over node ids in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Iterate over nodes in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &T)> {
        self.nodes.iter()
    }

    /// Ids of all nodes of one kind
    pub fn ids_of_kind(&self, kind: NodeKind) -> Vec<&NodeId> {
        self.nodes.keys().filter(|id| id.kind == kind).collect()
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, id: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    /// Direct dependents of a node
    pub fn dependents(&self, id: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Check that every edge points at a declared node
    pub fn validate(&self) -> Result<()> {
        for (node, deps) in &self.dependencies {
            if let Some(missing) = deps.iter().find(|dep| !self.nodes.contains_key(*dep)) {
                return Err(Error::DependencyUnsatisfied {
                    node: node.to_string(),
                    missing: missing.to_string(),
                    chain: self.dependency_chain(node).iter().map(ToString::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    /// Validate and compute the evaluation sequence
    pub fn sequence(&self) -> Result<Sequence> {
        self.validate()?;
        Sequence::from_graph(self)
    }

    /// Every node reachable by following dependents from `id` (excluding `id`)
    pub fn descendants(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.walk(id, &self.dependents)
    }

    /// Every node reachable by following dependencies from `id` (excluding `id`)
    pub fn ancestors(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.walk(id, &self.dependencies)
    }

    fn walk(&self, start: &NodeId, edges: &BTreeMap<NodeId, BTreeSet<NodeId>>) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&NodeId> = edges.get(start).into_iter().flatten().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(edges.get(next).into_iter().flatten());
            }
        }
        seen
    }

    /// Longest declared dependency path ending at `id`, root first
    ///
    /// Ties are broken by node order so the chain is stable across runs.
    /// Undeclared dependencies are included as the path's root.
    pub fn dependency_chain(&self, id: &NodeId) -> Vec<NodeId> {
        let mut memo: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut visiting = BTreeSet::new();
        self.chain_into(id, &mut memo, &mut visiting)
    }

    fn chain_into(
        &self,
        id: &NodeId,
        memo: &mut BTreeMap<NodeId, Vec<NodeId>>,
        visiting: &mut BTreeSet<NodeId>,
    ) -> Vec<NodeId> {
        if let Some(chain) = memo.get(id) {
            return chain.clone();
        }
        // A cycle has no longest path; stop at the repeated node.
        if !visiting.insert(id.clone()) {
            return vec![id.clone()];
        }

        let mut longest: Vec<NodeId> = Vec::new();
        for dep in self.dependencies(id) {
            let candidate = self.chain_into(dep, memo, visiting);
            if candidate.len() > longest.len() {
                longest = candidate;
            }
        }
        longest.push(id.clone());

        visiting.remove(id);
        memo.insert(id.clone(), longest.clone());
        longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(edges: &[(&str, &[&str])]) -> DependencyGraph<()> {
        let mut graph = DependencyGraph::new();
        for (node, _) in edges {
            graph
                .add_node(NodeId::new(NodeKind::Secret, *node), ())
                .expect("unique node");
        }
        for (node, deps) in edges {
            let id = NodeId::new(NodeKind::Secret, *node);
            for dep in *deps {
                graph
                    .add_edge(&id, NodeId::new(NodeKind::Secret, *dep))
                    .expect("node exists");
            }
        }
        graph
    }

    #[test]
    fn node_ids_render_kind_and_name() {
        assert_eq!(NodeId::secret("domain-name").to_string(), "secret/domain-name");
        assert_eq!(
            NodeId::namespaced(NodeKind::SecretBinding, "platform", "domain-name").to_string(),
            "binding/platform/domain-name"
        );
        assert_eq!(
            NodeId::new(NodeKind::DatabaseNetworkRule, "docs").to_string(),
            "database-network-rule/docs"
        );
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let mut graph = DependencyGraph::new();
        graph.add_node(NodeId::secret("a"), ()).expect("first add");
        let err = graph
            .add_node(NodeId::secret("a"), ())
            .expect_err("second add must fail");
        assert!(err.is_configuration());
    }

    #[test]
    fn self_edges_are_cycles() {
        let mut graph = DependencyGraph::new();
        let id = NodeId::secret("a");
        graph.add_node(id.clone(), ()).expect("add");
        let err = graph.add_edge(&id, id.clone()).expect_err("self edge");
        assert!(matches!(err, Error::Cycle { .. }));
    }

    #[test]
    fn edges_to_undeclared_nodes_fail_validation() {
        let mut graph = DependencyGraph::new();
        let id = NodeId::namespaced(NodeKind::Workload, "platform", "api");
        graph.add_node(id.clone(), ()).expect("add");
        graph
            .add_edge(&id, NodeId::namespaced(NodeKind::SecretBinding, "platform", "ghost"))
            .expect("edge recorded");

        match graph.validate().expect_err("ghost is undeclared") {
            Error::DependencyUnsatisfied { node, missing, .. } => {
                assert_eq!(node, "workload/platform/api");
                assert_eq!(missing, "binding/platform/ghost");
            }
            other => panic!("expected DependencyUnsatisfied, got {other:?}"),
        }
    }

    #[test]
    fn descendants_and_ancestors_follow_edges() {
        let graph = graph_of(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);

        let below: Vec<String> = graph
            .descendants(&NodeId::secret("a"))
            .iter()
            .map(|id| id.name.clone())
            .collect();
        assert_eq!(below, vec!["b", "c"]);

        let above: Vec<String> = graph
            .ancestors(&NodeId::secret("c"))
            .iter()
            .map(|id| id.name.clone())
            .collect();
        assert_eq!(above, vec!["a", "b"]);

        assert!(graph.descendants(&NodeId::secret("d")).is_empty());
    }

    #[test]
    fn dependency_chain_is_longest_path_root_first() {
        // e depends on a directly and on a via b -> c
        let graph = graph_of(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("e", &["a", "c"]),
        ]);
        let chain: Vec<String> = graph
            .dependency_chain(&NodeId::secret("e"))
            .iter()
            .map(|id| id.name.clone())
            .collect();
        assert_eq!(chain, vec!["a", "b", "c", "e"]);
    }

    #[test]
    fn ids_of_kind_filters() {
        let mut graph = DependencyGraph::new();
        graph.add_node(NodeId::secret("a"), 1).expect("add");
        graph.add_node(NodeId::cluster("main"), 2).expect("add");
        graph.add_node(NodeId::secret("b"), 3).expect("add");

        assert_eq!(graph.ids_of_kind(NodeKind::Secret).len(), 2);
        assert_eq!(graph.ids_of_kind(NodeKind::Cluster).len(), 1);
        assert_eq!(graph.get(&NodeId::cluster("main")), Some(&2));
        assert_eq!(graph.len(), 3);
    }
}
