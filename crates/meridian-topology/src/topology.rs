//! WorkloadTopology: namespace, bindings, workloads, routing and policy
//!
//! Built in that order. Each step only accepts inputs the previous steps
//! declared, so configuration mistakes surface here, before the graph is
//! evaluated against any backend.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Namespace;
use meridian_cluster::permissions::{kms_key_arn, secret_arn};
use meridian_cluster::{ClusterHandle, ControllerRefs, IdentityDeclaration, PermissionSet};
use meridian_common::manifest::{validate_dns_label, LABEL_PART_OF};
use meridian_common::{Declaration, Error, Manifest, NodeId, ObjectMeta, Result};
use meridian_vault::{SecretRecord, SecretVault};
use serde::Serialize;
use tracing::{debug, info};

use crate::binding::{default_field_map, FieldMapping, SecretBinding};
use crate::k8s::object_meta;
use crate::network_policy::NetworkPolicyDeclaration;
use crate::routing::{RouteValue, RoutingRule, RoutingTable};
use crate::workload::{WorkloadSpec, WorkloadUnit};

const COMPONENT: &str = "topology";

/// The workload namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NamespaceDeclaration {
    /// Namespace name
    pub name: String,
    #[serde(skip)]
    cluster: NodeId,
}

impl NamespaceDeclaration {
    /// Build the Namespace
    pub fn namespace(&self) -> Namespace {
        let meta = ObjectMeta::cluster_scoped(&self.name).with_label(LABEL_PART_OF, &self.name);
        Namespace {
            metadata: object_meta(&meta),
            ..Default::default()
        }
    }

    /// Render the Namespace
    pub fn render(&self) -> Result<Manifest> {
        Manifest::render("Namespace", &self.name, None, &self.namespace())
    }
}

impl Declaration for NamespaceDeclaration {
    fn node_id(&self) -> NodeId {
        NodeId::namespace(&self.name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        vec![self.cluster.clone()]
    }
}

/// Declares everything that runs inside one namespace of the cluster
#[derive(Clone, Debug)]
pub struct WorkloadTopology {
    namespace: NamespaceDeclaration,
    cluster: ClusterHandle,
    controllers: ControllerRefs,
    bindings: Vec<SecretBinding>,
    workloads: Vec<WorkloadUnit>,
    routing: Option<RoutingTable>,
    network_policy: Option<NetworkPolicyDeclaration>,
}

impl WorkloadTopology {
    /// Start a topology in `namespace` of `cluster`
    ///
    /// `controllers` are the installed controllers; bindings wait for the
    /// secret-sync ones and routing for the load-balancer ones.
    pub fn new(
        namespace: impl Into<String>,
        cluster: &ClusterHandle,
        controllers: &ControllerRefs,
    ) -> Result<Self> {
        let name = namespace.into();
        validate_dns_label(COMPONENT, "namespace", &name)?;
        Ok(Self {
            namespace: NamespaceDeclaration {
                name,
                cluster: cluster.node_id(),
            },
            cluster: cluster.clone(),
            controllers: controllers.clone(),
            bindings: Vec::new(),
            workloads: Vec::new(),
            routing: None,
            network_policy: None,
        })
    }

    /// Bind `record` into the namespace as the Secret `target_name`
    pub fn bind_secret(
        &mut self,
        record: &SecretRecord,
        target_name: impl Into<String>,
        field_map: Vec<FieldMapping>,
    ) -> Result<SecretBinding> {
        let target_name = target_name.into();
        if let Some(existing) = self
            .bindings
            .iter()
            .find(|b| b.source.logical_name == record.logical_name())
        {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "record '{}' is already bound into '{}' as '{}'",
                    record.logical_name(),
                    self.namespace.name,
                    existing.target_name
                ),
            ));
        }
        if self.bindings.iter().any(|b| b.target_name == target_name) {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "secret '{}' in '{}' already receives another record",
                    target_name, self.namespace.name
                ),
            ));
        }
        let sync = self.controllers.secret_sync();
        if sync.is_empty() {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "cannot bind '{}': no secret-sync controller is installed",
                    record.logical_name()
                ),
            ));
        }

        let mut requires = vec![self.cluster.node_id()];
        requires.extend(sync.iter().cloned());
        let binding = SecretBinding::new(
            record,
            &self.namespace.name,
            target_name,
            field_map,
            requires,
        )?;
        debug!(
            binding = %binding.node_id(),
            source = %binding.source.logical_name,
            keys = binding.field_map.len(),
            "Declared secret binding"
        );
        self.bindings.push(binding.clone());
        Ok(binding)
    }

    /// Bind every record of `vault` under its logical name
    pub fn bind_all(&mut self, vault: &SecretVault) -> Result<Vec<SecretBinding>> {
        vault
            .records()
            .iter()
            .map(|record| {
                self.bind_secret(record, record.logical_name(), default_field_map(record))
            })
            .collect()
    }

    /// Declare a workload mounting the bindings it names
    ///
    /// A workload with mounts gets its own identity that can read exactly
    /// the mounted records.
    pub fn deploy_workload(&mut self, spec: WorkloadSpec) -> Result<WorkloadUnit> {
        if self.routing.is_some() {
            return Err(Error::configuration(
                COMPONENT,
                format!("workload '{}' declared after routing was built", spec.name),
            ));
        }
        if self.workloads.iter().any(|w| w.spec.name == spec.name) {
            return Err(Error::configuration(
                COMPONENT,
                format!("workload '{}' declared twice", spec.name),
            ));
        }

        let mut mounted = Vec::with_capacity(spec.mounts.len());
        for target in &spec.mounts {
            let binding = self
                .bindings
                .iter()
                .find(|b| &b.target_name == target)
                .ok_or_else(|| {
                    Error::configuration(
                        COMPONENT,
                        format!(
                            "workload {}: mounted binding '{}' is not declared in '{}'",
                            spec.name, target, self.namespace.name
                        ),
                    )
                })?;
            mounted.push(binding.clone());
        }

        let identity = if mounted.is_empty() {
            None
        } else {
            Some(self.workload_identity(&spec.name, &mounted)?)
        };

        let unit = WorkloadUnit::new(
            spec,
            &self.namespace.name,
            mounted,
            identity,
            self.cluster.node_id(),
        )?;
        debug!(
            workload = %unit.node_id(),
            replicas = unit.spec.replicas,
            mounts = unit.bindings.len(),
            "Declared workload"
        );
        self.workloads.push(unit.clone());
        Ok(unit)
    }

    fn workload_identity(
        &self,
        name: &str,
        mounted: &[SecretBinding],
    ) -> Result<IdentityDeclaration> {
        let region = &self.cluster.region;
        let account = &self.cluster.account_id;
        let secrets = mounted
            .iter()
            .map(|b| secret_arn(region, account, &b.source.storage_location))
            .collect();
        let keys: BTreeSet<String> = mounted
            .iter()
            .map(|b| kms_key_arn(region, account, &b.source.encryption_key_ref))
            .collect();

        IdentityDeclaration::new(
            &self.cluster.name,
            account,
            &self.namespace.name,
            name,
            PermissionSet::secret_reader(secrets, keys.into_iter().collect()),
        )
    }

    /// Route every workload that claims a path prefix through one Ingress
    ///
    /// Host and certificate given as record references make the Ingress
    /// depend on those records.
    pub fn build_routing_table(
        &mut self,
        host: impl Into<RouteValue>,
        certificate_ref: impl Into<RouteValue>,
    ) -> Result<RoutingTable> {
        if self.routing.is_some() {
            return Err(Error::configuration(COMPONENT, "routing table already built"));
        }
        if self.network_policy.is_some() {
            return Err(Error::configuration(
                COMPONENT,
                "routing must be built before the network policy is applied",
            ));
        }
        let load_balancers = self.controllers.load_balancer();
        if load_balancers.is_empty() {
            return Err(Error::configuration(
                COMPONENT,
                "cannot route: no load-balancer controller is installed",
            ));
        }

        let mut routes = Vec::new();
        let mut requires = vec![self.cluster.node_id()];
        requires.extend(load_balancers.iter().cloned());
        for unit in &self.workloads {
            if let Some(prefix) = &unit.spec.path_prefix {
                routes.push(RoutingRule::new(prefix, &unit.spec.name, unit.spec.container_port)?);
                requires.push(unit.node_id());
            }
        }

        let table = RoutingTable::new(
            &self.namespace.name,
            host.into(),
            certificate_ref.into(),
            routes,
            requires,
        )?;
        info!(
            namespace = %self.namespace.name,
            host = %table.host,
            rules = table.rules.len(),
            "Built routing table"
        );
        self.routing = Some(table.clone());
        Ok(table)
    }

    /// Deny all ingress to the namespace except from `allowed_sources`
    ///
    /// The policy opens only the routed ports and waits for the routing
    /// table. Without a routing table it denies all ingress and waits only
    /// for the namespace (and the cluster it is applied to).
    pub fn apply_network_policy(
        &mut self,
        allowed_sources: &[String],
    ) -> Result<NetworkPolicyDeclaration> {
        if self.network_policy.is_some() {
            return Err(Error::configuration(COMPONENT, "network policy already applied"));
        }

        let mut requires = vec![self.cluster.node_id()];
        let ports = match &self.routing {
            Some(routing) => {
                requires.push(routing.node_id());
                routing.ports()
            }
            None => Vec::new(),
        };
        let policy = NetworkPolicyDeclaration::new(
            &self.namespace.name,
            allowed_sources,
            ports,
            requires,
        )?;
        debug!(
            policy = %policy.node_id(),
            sources = policy.allowed_sources.len(),
            "Declared network policy"
        );
        self.network_policy = Some(policy.clone());
        Ok(policy)
    }

    /// Namespace name
    pub fn namespace(&self) -> &str {
        &self.namespace.name
    }

    /// The namespace node
    pub fn namespace_declaration(&self) -> &NamespaceDeclaration {
        &self.namespace
    }

    /// Declared bindings
    pub fn bindings(&self) -> &[SecretBinding] {
        &self.bindings
    }

    /// Binding by target name
    pub fn binding(&self, target_name: &str) -> Option<&SecretBinding> {
        self.bindings.iter().find(|b| b.target_name == target_name)
    }

    /// Declared workloads
    pub fn workloads(&self) -> &[WorkloadUnit] {
        &self.workloads
    }

    /// Workload by name
    pub fn workload(&self, name: &str) -> Option<&WorkloadUnit> {
        self.workloads.iter().find(|w| w.spec.name == name)
    }

    /// The routing table, once built
    pub fn routing(&self) -> Option<&RoutingTable> {
        self.routing.as_ref()
    }

    /// The network policy, once applied
    pub fn network_policy(&self) -> Option<&NetworkPolicyDeclaration> {
        self.network_policy.as_ref()
    }

    /// Identities of the declared workloads
    pub fn identities(&self) -> Vec<&IdentityDeclaration> {
        self.workloads
            .iter()
            .filter_map(|w| w.identity.as_ref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::FieldSource;
    use meridian_cluster::network::{NetworkLayout, NetworkSpec};
    use meridian_cluster::ControllerRole;
    use meridian_common::NodeKind;
    use meridian_vault::GenerationPolicy;
    use proptest::prelude::*;

    fn vault() -> SecretVault {
        let mut builder = SecretVault::builder("meridian/prod", "alias/meridian");
        for name in ["domain-name", "certificate", "oauth-client-id", "oauth-client-secret"] {
            builder
                .declare_secret(name, GenerationPolicy::external())
                .expect("valid");
        }
        builder
            .declare_secret("admin-password", GenerationPolicy::random(32))
            .expect("valid");
        builder
            .declare_secret("docdb-credential", GenerationPolicy::credential("docdbadmin"))
            .expect("valid");
        builder.build().expect("vault builds")
    }

    fn cluster() -> ClusterHandle {
        let network = NetworkLayout::partition(&NetworkSpec {
            vpc_cidr: "10.0.0.0/16".to_string(),
            zones: vec!["us-east-1a".into(), "us-east-1b".into(), "us-east-1c".into()],
            subnet_prefix: 20,
        })
        .expect("valid network");
        ClusterHandle::new("prod", "us-east-1", "123456789012", network)
    }

    fn controllers() -> ControllerRefs {
        let mut refs = ControllerRefs::default();
        refs.insert(ControllerRole::LoadBalancer, NodeId::controller("aws-load-balancer-controller"));
        refs.insert(ControllerRole::SecretSync, NodeId::controller("secrets-store-csi-driver"));
        refs.insert(
            ControllerRole::SecretSync,
            NodeId::controller("secrets-store-csi-provider-aws"),
        );
        refs
    }

    fn topology() -> WorkloadTopology {
        WorkloadTopology::new("apps", &cluster(), &controllers()).expect("valid namespace")
    }

    // ==========================================================================
    // Story Tests: Declaring the Workload Topology
    // ==========================================================================

    /// Story: five values and one credential become six isolated Secrets
    #[test]
    fn story_every_record_gets_its_own_secret() {
        let vault = vault();
        let mut topology = topology();
        let bindings = topology.bind_all(&vault).expect("all records bind");

        assert_eq!(bindings.len(), 6);
        let targets: BTreeSet<&str> = bindings.iter().map(|b| b.target_name.as_str()).collect();
        assert_eq!(targets.len(), 6);

        let credential = topology.binding("docdb-credential").expect("bound");
        assert_eq!(credential.field_map.len(), 2);
        assert!(credential
            .field_map
            .iter()
            .all(|m| matches!(m.source, FieldSource::NamedField(_))));

        for binding in &bindings {
            let deps = binding.dependencies();
            assert!(deps.contains(&NodeId::secret(&binding.source.logical_name)));
            assert!(deps.contains(&NodeId::namespace("apps")));
            assert!(deps.contains(&NodeId::controller("secrets-store-csi-driver")));
        }
    }

    #[test]
    fn a_record_binds_once_per_namespace() {
        let vault = vault();
        let mut topology = topology();
        let record = vault.require("admin-password").expect("declared");
        topology
            .bind_secret(record, "admin-password", default_field_map(record))
            .expect("first binding");

        let err = topology
            .bind_secret(record, "admin-password-copy", default_field_map(record))
            .expect_err("second binding of the same record");
        assert!(err.is_configuration());

        let other = vault.require("certificate").expect("declared");
        assert!(topology
            .bind_secret(other, "admin-password", default_field_map(other))
            .is_err());
    }

    #[test]
    fn bindings_need_a_secret_sync_controller() {
        let vault = vault();
        let mut topology =
            WorkloadTopology::new("apps", &cluster(), &ControllerRefs::default()).expect("valid");
        let err = topology.bind_all(&vault).expect_err("no driver installed");
        assert!(err.to_string().contains("secret-sync"));
    }

    /// Story: a workload reads only the records it mounts
    #[test]
    fn story_workload_identity_is_scoped_to_its_mounts() {
        let vault = vault();
        let mut topology = topology();
        topology.bind_all(&vault).expect("bound");

        let unit = topology
            .deploy_workload(
                WorkloadSpec::new("auth", "registry.example.com/auth:2.0")
                    .routed("/auth/*")
                    .with_env("CLIENT_ID", "oauth-client-id", "value")
                    .with_env("CLIENT_SECRET", "oauth-client-secret", "value"),
            )
            .expect("valid workload");

        let identity = unit.identity.as_ref().expect("mounted workload has identity");
        assert_eq!(identity.role_name, "prod-apps-auth");
        let statements = identity.permissions.statements();
        assert_eq!(statements.len(), 2);
        match &statements[0].scope {
            meridian_cluster::ResourceScope::Arns(arns) => {
                assert_eq!(arns.len(), 2);
                assert!(arns[0].contains("meridian/prod/oauth-client-id"));
            }
            other => panic!("unexpected scope {:?}", other),
        }

        let deps = unit.dependencies();
        assert!(deps.contains(&NodeId::namespaced(
            NodeKind::SecretBinding,
            "apps",
            "oauth-client-secret"
        )));
        assert!(deps.contains(&identity.node_id()));

        let web = topology
            .deploy_workload(WorkloadSpec::new("web", "nginx:1.27").routed("/web/*"))
            .expect("unmounted workload");
        assert!(web.identity.is_none());
    }

    #[test]
    fn workloads_must_mount_declared_bindings() {
        let mut topology = topology();
        let err = topology
            .deploy_workload(WorkloadSpec::new("api", "api:1").with_env("X", "missing", "value"))
            .expect_err("binding not declared");
        assert!(err.is_configuration());
        assert!(topology.workloads().is_empty());
    }

    /// Story: routing waits for the load balancer and policy waits for routing
    #[test]
    fn story_routing_then_policy() {
        let vault = vault();
        let mut topology = topology();
        topology.bind_all(&vault).expect("bound");
        topology
            .deploy_workload(WorkloadSpec::new("web", "web:1").routed("/web/*"))
            .expect("valid");
        topology
            .deploy_workload(WorkloadSpec::new("engine", "engine:1").routed("/engine/*"))
            .expect("valid");
        topology
            .deploy_workload(WorkloadSpec::new("worker", "worker:1"))
            .expect("unrouted workload");

        let public = cluster().network.public_cidrs();
        let table = topology
            .build_routing_table("app.example.com", "arn:aws:acm:us-east-1:123456789012:certificate/abc")
            .expect("valid routing");
        assert_eq!(table.rules.len(), 2);
        let deps = table.dependencies();
        assert!(deps.contains(&NodeId::controller("aws-load-balancer-controller")));
        assert!(deps.contains(&NodeId::namespaced(NodeKind::Workload, "apps", "engine")));
        assert!(!deps.contains(&NodeId::namespaced(NodeKind::Workload, "apps", "worker")));

        assert!(topology
            .deploy_workload(WorkloadSpec::new("late", "late:1"))
            .is_err());

        let policy = topology.apply_network_policy(&public).expect("valid policy");
        assert!(policy.dependencies().contains(&table.node_id()));
        assert_eq!(policy.allowed_sources, public);
        assert_eq!(policy.ports, vec![8080]);
    }

    /// Story: a namespace with nothing routed still denies all ingress
    #[test]
    fn story_unrouted_namespace_denies_all_ingress() {
        let vault = vault();
        let mut topology = topology();
        topology.bind_all(&vault).expect("bound");
        topology
            .deploy_workload(WorkloadSpec::new("worker", "worker:1"))
            .expect("unrouted workload");

        let public = cluster().network.public_cidrs();
        let policy = topology.apply_network_policy(&public).expect("valid policy");
        assert!(policy.ports.is_empty());
        assert_eq!(
            policy.dependencies(),
            vec![NodeId::namespace("apps"), NodeId::cluster("prod")]
        );
        assert!(policy.policy().spec.ingress.is_empty());
        assert_eq!(policy.policy().spec.policy_types, vec!["Ingress"]);

        // Routing after the policy would leave the policy stale
        assert!(topology
            .build_routing_table("app.example.com", "cert")
            .expect_err("policy already applied")
            .is_configuration());
    }

    #[test]
    fn overlapping_workload_prefixes_fail_routing() {
        let mut topology = topology();
        topology
            .deploy_workload(WorkloadSpec::new("engine", "engine:1").routed("/engine/*"))
            .expect("valid");
        topology
            .deploy_workload(WorkloadSpec::new("admin", "admin:1").routed("/engine/admin/*"))
            .expect("valid");
        let err = topology
            .build_routing_table("app.example.com", "cert")
            .expect_err("overlap");
        assert!(err.is_configuration());
        assert!(topology.routing().is_none());
    }

    #[test]
    fn namespace_follows_the_cluster() {
        let topology = topology();
        let ns = topology.namespace_declaration();
        assert_eq!(ns.dependencies(), vec![NodeId::cluster("prod")]);
        let manifest = ns.render().expect("renders");
        assert_eq!(manifest.kind, "Namespace");
        assert!(manifest.namespace.is_none());
        assert!(manifest.yaml.contains("name: apps"));
    }

    proptest! {
        /// No Secret in the namespace ever receives more than one record
        #[test]
        fn bindings_stay_isolated(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
            let vault = vault();
            let mut topology = topology();
            for index in order {
                let record = &vault.records()[index];
                topology
                    .bind_secret(record, record.logical_name(), default_field_map(record))
                    .expect("distinct record");
            }
            let sources: BTreeSet<&str> = topology
                .bindings()
                .iter()
                .map(|b| b.source.logical_name.as_str())
                .collect();
            prop_assert_eq!(sources.len(), topology.bindings().len());
            for binding in topology.bindings() {
                let class = binding.provider_class().expect("renders");
                prop_assert_eq!(class.spec.secret_objects.len(), 1);
            }
        }
    }
}
