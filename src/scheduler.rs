//! Graph evaluation against the backends
//!
//! The graph is split into Kahn groups. Groups run one after another; the
//! nodes of one group run concurrently and only read outputs of earlier
//! groups, so no locking is needed. Nothing is retried here.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use meridian_cluster::{ClusterHandle, DatabaseHandle};
use meridian_common::{DependencyGraph, Error, Manifest, NodeId, NodeKind, Result};
use tracing::{debug, error, info, warn};

use crate::backend::Backends;
use crate::platform::Resource;

/// What to do after a node fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Finish the running group, then evaluate nothing further
    #[default]
    FailFast,
    /// Keep evaluating every node that does not depend on a failure
    ContinueIndependent,
}

/// Result of one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Evaluated successfully
    Completed,
    /// Evaluation failed with this message
    Failed(String),
    /// Not evaluated because an ancestor failed
    Skipped {
        /// The failed ancestor
        failed_ancestor: NodeId,
    },
    /// Not evaluated because evaluation stopped early
    NotAttempted,
}

/// Values produced by completed nodes that later nodes consume
#[derive(Clone, Debug, Default)]
struct Outputs {
    completed: BTreeSet<NodeId>,
    secret_ids: BTreeMap<String, String>,
    clusters: BTreeMap<String, ClusterHandle>,
    scopes: BTreeMap<String, String>,
    identities: BTreeMap<NodeId, String>,
    synced: BTreeMap<NodeId, String>,
    database: Option<DatabaseHandle>,
}

impl Outputs {
    /// The cluster a node declared a dependency on
    fn cluster_for<T>(&self, graph: &DependencyGraph<T>, id: &NodeId) -> Result<&ClusterHandle> {
        let dep = graph
            .dependencies(id)
            .find(|dep| dep.kind == NodeKind::Cluster)
            .ok_or_else(|| Error::dependency_unsatisfied(id.to_string(), "a cluster dependency"))?;
        self.clusters
            .get(&dep.name)
            .ok_or_else(|| Error::dependency_unsatisfied(id.to_string(), dep.to_string()))
    }
}

enum NodeOutput {
    Secret { logical_name: String, id: String },
    Cluster(ClusterHandle),
    Identity(String),
    Scope { rule: String, scope: String },
    Database(DatabaseHandle),
    Synced(String),
    Applied,
}

/// Outcome of evaluating a whole graph
#[derive(Debug, Default)]
pub struct EvaluationReport {
    outcomes: BTreeMap<NodeId, NodeOutcome>,
    completion_order: Vec<NodeId>,
    failures: Vec<Error>,
    outputs: Outputs,
}

impl EvaluationReport {
    /// Outcome of a node
    pub fn outcome(&self, id: &NodeId) -> Option<&NodeOutcome> {
        self.outcomes.get(id)
    }

    /// Every outcome, by node
    pub fn outcomes(&self) -> &BTreeMap<NodeId, NodeOutcome> {
        &self.outcomes
    }

    /// Completed nodes in the order they finished
    pub fn completion_order(&self) -> &[NodeId] {
        &self.completion_order
    }

    /// Whether every node completed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && self
                .outcomes
                .values()
                .all(|outcome| *outcome == NodeOutcome::Completed)
    }

    /// Failures in the order they occurred
    pub fn failures(&self) -> &[Error] {
        &self.failures
    }

    /// The first failure
    pub fn first_failure(&self) -> Option<&Error> {
        self.failures.first()
    }

    /// Handle the backend returned for a created cluster
    pub fn cluster(&self, name: &str) -> Option<&ClusterHandle> {
        self.outputs.clusters.get(name)
    }

    /// The created database
    pub fn database(&self) -> Option<&DatabaseHandle> {
        self.outputs.database.as_ref()
    }

    /// Store identifier of a created secret record
    pub fn secret_id(&self, logical_name: &str) -> Option<&str> {
        self.outputs.secret_ids.get(logical_name).map(String::as_str)
    }

    /// Reference of a granted identity
    pub fn identity_ref(&self, id: &NodeId) -> Option<&str> {
        self.outputs.identities.get(id).map(String::as_str)
    }

    /// Name of the Secret a binding synced
    pub fn synced_secret(&self, id: &NodeId) -> Option<&str> {
        self.outputs.synced.get(id).map(String::as_str)
    }

    /// Turn the first failure into an error
    pub fn into_result(mut self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(self.failures.remove(0))
        }
    }

    fn record(&mut self, id: &NodeId, output: NodeOutput) {
        match output {
            NodeOutput::Secret { logical_name, id } => {
                self.outputs.secret_ids.insert(logical_name, id);
            }
            NodeOutput::Cluster(handle) => {
                self.outputs.clusters.insert(handle.name.clone(), handle);
            }
            NodeOutput::Identity(reference) => {
                self.outputs.identities.insert(id.clone(), reference);
            }
            NodeOutput::Scope { rule, scope } => {
                self.outputs.scopes.insert(rule, scope);
            }
            NodeOutput::Database(handle) => self.outputs.database = Some(handle),
            NodeOutput::Synced(name) => {
                self.outputs.synced.insert(id.clone(), name);
            }
            NodeOutput::Applied => {}
        }
        self.outputs.completed.insert(id.clone());
        self.outcomes.insert(id.clone(), NodeOutcome::Completed);
        self.completion_order.push(id.clone());
    }
}

/// Evaluates a platform graph against the backends
#[derive(Clone)]
pub struct Scheduler {
    backends: Backends,
    policy: FailurePolicy,
}

impl Scheduler {
    /// Scheduler with the fail-fast policy
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            policy: FailurePolicy::default(),
        }
    }

    /// Use a different failure policy
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Evaluate the graph; the first node failure becomes the error
    pub async fn evaluate(&self, graph: &DependencyGraph<Resource>) -> Result<EvaluationReport> {
        self.evaluate_with_report(graph).await?.into_result()
    }

    /// Evaluate the graph and report every node's outcome
    ///
    /// Only graph errors (cycles, undeclared dependencies) are returned as
    /// `Err`; node failures are recorded in the report.
    pub async fn evaluate_with_report(
        &self,
        graph: &DependencyGraph<Resource>,
    ) -> Result<EvaluationReport> {
        let sequence = graph.sequence()?;
        let mut report = EvaluationReport::default();
        for id in graph.ids() {
            report.outcomes.insert(id.clone(), NodeOutcome::NotAttempted);
        }
        let mut blocked: BTreeMap<NodeId, NodeId> = BTreeMap::new();

        for (index, group) in sequence.iter_groups() {
            if self.policy == FailurePolicy::FailFast && !report.failures.is_empty() {
                break;
            }

            let mut runnable = Vec::with_capacity(group.len());
            for id in &group.nodes {
                match blocked.get(id) {
                    Some(ancestor) => {
                        warn!(node = %id, failed = %ancestor, "Skipping node after failed ancestor");
                        report.outcomes.insert(
                            id.clone(),
                            NodeOutcome::Skipped {
                                failed_ancestor: ancestor.clone(),
                            },
                        );
                    }
                    None => runnable.push(id),
                }
            }
            if runnable.is_empty() {
                continue;
            }

            info!(group = index, nodes = runnable.len(), "Evaluating group");
            let outputs = &report.outputs;
            let results = join_all(runnable.iter().map(|id| async move {
                (*id, self.evaluate_node(graph, id, outputs).await)
            }))
            .await;

            for (id, result) in results {
                match result {
                    Ok(output) => {
                        debug!(node = %id, "Node completed");
                        report.record(id, output);
                    }
                    Err(err) => {
                        let chain = graph
                            .dependency_chain(id)
                            .iter()
                            .map(ToString::to_string)
                            .collect();
                        let err = Error::evaluation(id.to_string(), chain, err);
                        error!(node = %id, error = %err, "Node failed");
                        report
                            .outcomes
                            .insert(id.clone(), NodeOutcome::Failed(err.to_string()));
                        for descendant in graph.descendants(id) {
                            blocked.entry(descendant).or_insert_with(|| id.clone());
                        }
                        report.failures.push(err);
                    }
                }
            }
        }

        for (id, ancestor) in blocked {
            if let Some(outcome) = report.outcomes.get_mut(&id) {
                if *outcome == NodeOutcome::NotAttempted {
                    *outcome = NodeOutcome::Skipped {
                        failed_ancestor: ancestor,
                    };
                }
            }
        }

        info!(
            completed = report.completion_order.len(),
            failed = report.failures.len(),
            total = graph.len(),
            "Evaluation finished"
        );
        Ok(report)
    }

    async fn evaluate_node(
        &self,
        graph: &DependencyGraph<Resource>,
        id: &NodeId,
        outputs: &Outputs,
    ) -> Result<NodeOutput> {
        let resource = graph
            .get(id)
            .ok_or_else(|| Error::dependency_unsatisfied(id.to_string(), "its own declaration"))?;
        debug!(node = %id, "Evaluating node");

        match resource {
            Resource::Secret(record) => {
                let secret_id = self.backends.secrets.create_secret(record).await?;
                Ok(NodeOutput::Secret {
                    logical_name: record.logical_name().to_string(),
                    id: secret_id,
                })
            }
            Resource::Cluster(cluster) => {
                let handle = self.backends.cluster.create_cluster(cluster).await?;
                Ok(NodeOutput::Cluster(handle))
            }
            Resource::Identity(identity) => {
                let cluster = outputs.cluster_for(graph, id)?;
                let reference = self
                    .backends
                    .cluster
                    .grant_identity(
                        cluster,
                        &identity.name,
                        &identity.namespace,
                        &identity.permissions,
                    )
                    .await?;
                Ok(NodeOutput::Identity(reference))
            }
            Resource::Controller(controller) => {
                let cluster = outputs.cluster_for(graph, id)?;
                let spec = &controller.spec;
                self.backends
                    .cluster
                    .install_chart(cluster, &spec.chart, &spec.name, &spec.namespace, &spec.values)
                    .await?;
                Ok(NodeOutput::Applied)
            }
            Resource::DatabaseNetworkRule(rule) => {
                let scope = self.backends.database.create_network_scope(rule).await?;
                Ok(NodeOutput::Scope {
                    rule: rule.name.clone(),
                    scope,
                })
            }
            Resource::Database(database) => {
                let rule = &database.network_rule.name;
                let scope = outputs.scopes.get(rule).ok_or_else(|| {
                    Error::dependency_unsatisfied(id.to_string(), format!("network scope {}", rule))
                })?;
                let endpoint = self
                    .backends
                    .database
                    .create_cluster(scope, &database.spec, &database.credential_policy)
                    .await?;
                let handle = DatabaseHandle::new(endpoint, Some(database.credential.clone()))?;
                Ok(NodeOutput::Database(handle))
            }
            Resource::Binding(binding) => {
                let cluster = outputs.cluster_for(graph, id)?;
                let secret_id = outputs
                    .secret_ids
                    .get(&binding.source.logical_name)
                    .ok_or_else(|| {
                        Error::dependency_unsatisfied(
                            id.to_string(),
                            NodeId::secret(&binding.source.logical_name).to_string(),
                        )
                    })?;
                let synced = self
                    .backends
                    .secrets
                    .bind_secret_to_namespace(secret_id, &binding.namespace, binding)
                    .await?;
                self.apply(cluster, vec![binding.render()?]).await?;
                Ok(NodeOutput::Synced(synced))
            }
            Resource::Workload(unit) => {
                let cluster = outputs.cluster_for(graph, id)?;
                let mut unit = unit.clone();
                unit.advance(&outputs.completed);
                if !unit.is_deployable() {
                    let missing: Vec<String> = unit
                        .missing(&outputs.completed)
                        .iter()
                        .map(ToString::to_string)
                        .collect();
                    return Err(Error::dependency_unsatisfied(id.to_string(), missing.join(", ")));
                }
                self.apply(cluster, unit.render()?).await?;
                unit.mark_deployed()?;
                Ok(NodeOutput::Applied)
            }
            Resource::Routing(table) => {
                let cluster = outputs.cluster_for(graph, id)?;
                let mut values = BTreeMap::new();
                for name in table.secret_refs() {
                    let secret_id = outputs.secret_ids.get(name).ok_or_else(|| {
                        Error::dependency_unsatisfied(id.to_string(), NodeId::secret(name).to_string())
                    })?;
                    let value = self.backends.secrets.resolve_reference(secret_id).await?;
                    values.insert(name.to_string(), value);
                }
                self.apply(cluster, vec![table.resolved(&values)?.render()?])
                    .await?;
                Ok(NodeOutput::Applied)
            }
            Resource::Namespace(_) | Resource::NetworkPolicy(_) => {
                let cluster = outputs.cluster_for(graph, id)?;
                self.apply(cluster, resource.manifests()?).await?;
                Ok(NodeOutput::Applied)
            }
        }
    }

    async fn apply(&self, cluster: &ClusterHandle, manifests: Vec<Manifest>) -> Result<()> {
        for manifest in &manifests {
            self.backends.cluster.apply_manifest(cluster, manifest).await?;
        }
        Ok(())
    }
}
