//! Platform assembly: the three components wired into one dependency graph
//!
//! Declarations are built strictly in order (vault, then cluster, then
//! topology), each receiving only the identifiers and handles it needs. The
//! resulting nodes and their declared edges form the graph handed to the
//! [`Scheduler`](crate::scheduler::Scheduler).

use meridian_cluster::{
    ClusterDeclaration, ClusterProvisioner, ControllerDeclaration, ControllerSpec,
    DatabaseDeclaration, DatabaseNetworkRule, IdentityDeclaration,
};
use std::collections::BTreeMap;

use meridian_common::{Declaration, DependencyGraph, Error, Manifest, NodeId, Result, Sequence};
use meridian_topology::{
    NamespaceDeclaration, NetworkPolicyDeclaration, RoutingTable, SecretBinding, WorkloadTopology,
    WorkloadUnit,
};
use meridian_vault::{SecretRecord, SecretVault};
use tracing::info;

use crate::config::PlatformConfig;

const COMPONENT: &str = "platform";

/// Payload of a graph node
#[derive(Clone, Debug)]
pub enum Resource {
    /// Secret record
    Secret(SecretRecord),
    /// Cluster with its capacity
    Cluster(ClusterDeclaration),
    /// Cloud identity of a controller or workload
    Identity(IdentityDeclaration),
    /// Chart-installed controller
    Controller(ControllerDeclaration),
    /// Database network scope
    DatabaseNetworkRule(DatabaseNetworkRule),
    /// Managed database
    Database(DatabaseDeclaration),
    /// Workload namespace
    Namespace(NamespaceDeclaration),
    /// Secret binding
    Binding(SecretBinding),
    /// Workload unit
    Workload(WorkloadUnit),
    /// Ingress routing
    Routing(RoutingTable),
    /// Namespace network policy
    NetworkPolicy(NetworkPolicyDeclaration),
}

impl Resource {
    /// Kubernetes manifests the node applies, in apply order
    ///
    /// Nodes realised through other backend calls (secrets, identities,
    /// charts, database) render nothing.
    pub fn manifests(&self) -> Result<Vec<Manifest>> {
        match self {
            Resource::Cluster(cluster) => cluster.render(),
            Resource::Namespace(namespace) => Ok(vec![namespace.render()?]),
            Resource::Binding(binding) => Ok(vec![binding.render()?]),
            Resource::Workload(unit) => unit.render(),
            Resource::Routing(routing) => Ok(vec![routing.render()?]),
            Resource::NetworkPolicy(policy) => Ok(vec![policy.render()?]),
            Resource::Secret(_)
            | Resource::Identity(_)
            | Resource::Controller(_)
            | Resource::DatabaseNetworkRule(_)
            | Resource::Database(_) => Ok(Vec::new()),
        }
    }
}

/// A fully declared platform
#[derive(Clone, Debug)]
pub struct Platform {
    vault: SecretVault,
    provisioner: ClusterProvisioner,
    topology: WorkloadTopology,
    graph: DependencyGraph<Resource>,
}

impl Platform {
    /// Declare every component from `config` and assemble the graph
    ///
    /// Fails with the first configuration error; nothing is evaluated.
    pub fn build(config: &PlatformConfig) -> Result<Self> {
        let vault = build_vault(config)?;

        let mut provisioner = ClusterProvisioner::new(
            &config.cluster.name,
            &config.cluster.region,
            &config.cluster.account_id,
            &vault.exports(),
        )?;
        if let Some(version) = &config.cluster.kubernetes_version {
            provisioner = provisioner.with_kubernetes_version(version);
        }
        let cluster = provisioner.provision_cluster(config.cluster.capacity.clone())?;

        let toggles = &config.cluster.controllers;
        if toggles.load_balancer {
            provisioner.install_controller(ControllerSpec::aws_load_balancer_controller(&cluster))?;
        }
        if toggles.autoscaler {
            provisioner.install_controller(ControllerSpec::cluster_autoscaler(&cluster))?;
        }
        if toggles.secret_sync {
            provisioner.install_controller(ControllerSpec::secrets_store_csi_driver())?;
            provisioner.install_controller(ControllerSpec::secrets_store_csi_provider_aws())?;
        }
        if toggles.monitoring {
            provisioner.install_controller(ControllerSpec::kube_prometheus_stack())?;
        }

        if let Some(database) = &config.database {
            provisioner.provision_database(&cluster, &database.spec, vault.get(&database.credential))?;
        }

        let topology_config = &config.topology;
        let mut topology = WorkloadTopology::new(
            &topology_config.namespace,
            &cluster,
            &provisioner.controller_refs(),
        )?;
        topology.bind_all(&vault)?;
        for workload in &topology_config.workloads {
            topology.deploy_workload(workload.clone())?;
        }
        if topology_config.workloads.iter().any(|w| w.path_prefix.is_some()) {
            topology.build_routing_table(
                topology_config.host.clone(),
                topology_config.certificate_ref.clone(),
            )?;
        }
        let sources = if topology_config.allowed_sources.is_empty() {
            cluster.network.public_cidrs()
        } else {
            topology_config.allowed_sources.clone()
        };
        topology.apply_network_policy(&sources)?;

        let graph = assemble(&vault, &provisioner, &topology)?;
        info!(
            nodes = graph.len(),
            secrets = vault.len(),
            workloads = topology.workloads().len(),
            "Declared platform"
        );

        Ok(Self {
            vault,
            provisioner,
            topology,
            graph,
        })
    }

    /// The dependency graph
    pub fn graph(&self) -> &DependencyGraph<Resource> {
        &self.graph
    }

    /// The secret vault
    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    /// The cluster provisioner
    pub fn provisioner(&self) -> &ClusterProvisioner {
        &self.provisioner
    }

    /// The workload topology
    pub fn topology(&self) -> &WorkloadTopology {
        &self.topology
    }

    /// Evaluation groups
    pub fn sequence(&self) -> Result<Sequence> {
        self.graph.sequence()
    }

    /// Every manifest, nodes in evaluation order
    ///
    /// Identical configuration renders identical output.
    pub fn render(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        for id in self.sequence()?.all_in_order() {
            if let Some(resource) = self.graph.get(&id) {
                manifests.extend(resource.manifests()?);
            }
        }
        Ok(manifests)
    }

    /// Evaluation groups as node ids, for display
    pub fn plan(&self) -> Result<Vec<Vec<NodeId>>> {
        Ok(self
            .sequence()?
            .groups()
            .iter()
            .map(|group| group.nodes.clone())
            .collect())
    }
}

fn build_vault(config: &PlatformConfig) -> Result<SecretVault> {
    let mut builder = SecretVault::builder(&config.vault.prefix, &config.vault.encryption_key_ref);
    for secret in &config.vault.secrets {
        builder.declare_secret(&secret.name, secret.policy.clone())?;
    }
    builder.build()
}

fn assemble(
    vault: &SecretVault,
    provisioner: &ClusterProvisioner,
    topology: &WorkloadTopology,
) -> Result<DependencyGraph<Resource>> {
    let identities = provisioner
        .controllers()
        .iter()
        .filter_map(|controller| controller.identity.as_ref())
        .chain(topology.workloads().iter().filter_map(|unit| unit.identity.as_ref()));
    check_distinct_roles(identities)?;

    let mut graph = DependencyGraph::new();

    for record in vault.records() {
        graph.add_declaration(record, Resource::Secret(record.clone()))?;
    }

    if let Some(cluster) = provisioner.cluster() {
        graph.add_declaration(cluster, Resource::Cluster(cluster.clone()))?;
    }
    for controller in provisioner.controllers() {
        if let Some(identity) = &controller.identity {
            graph.add_declaration(identity, Resource::Identity(identity.clone()))?;
        }
        graph.add_declaration(controller, Resource::Controller(controller.clone()))?;
    }
    if let Some(database) = provisioner.database() {
        let rule = &database.network_rule;
        graph.add_declaration(rule, Resource::DatabaseNetworkRule(rule.clone()))?;
        graph.add_declaration(database, Resource::Database(database.clone()))?;
    }

    let namespace = topology.namespace_declaration();
    graph.add_declaration(namespace, Resource::Namespace(namespace.clone()))?;
    for binding in topology.bindings() {
        graph.add_declaration(binding, Resource::Binding(binding.clone()))?;
    }
    for unit in topology.workloads() {
        if let Some(identity) = &unit.identity {
            graph.add_declaration(identity, Resource::Identity(identity.clone()))?;
        }
        graph.add_declaration(unit, Resource::Workload(unit.clone()))?;
    }
    if let Some(routing) = topology.routing() {
        graph.add_declaration(routing, Resource::Routing(routing.clone()))?;
    }
    if let Some(policy) = topology.network_policy() {
        graph.add_declaration(policy, Resource::NetworkPolicy(policy.clone()))?;
    }

    // Catches undeclared edge targets and cycles before anything is evaluated
    graph.sequence()?;
    Ok(graph)
}

/// Two service accounts must never assume the same role
fn check_distinct_roles<'a>(
    identities: impl Iterator<Item = &'a IdentityDeclaration>,
) -> Result<()> {
    let mut seen: BTreeMap<&str, NodeId> = BTreeMap::new();
    for identity in identities {
        let id = identity.node_id();
        if let Some(other) = seen.insert(&identity.role_arn, id.clone()) {
            return Err(Error::configuration(
                COMPONENT,
                format!("{} and {} resolve to the same role {}", other, id, identity.role_arn),
            ));
        }
    }
    Ok(())
}
