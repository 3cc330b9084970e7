//! ClusterProvisioner: the cluster, its controllers and the database
//!
//! The provisioner only declares. It receives the vault's exported
//! identifiers (never values) and produces declarations that the graph
//! evaluator later turns into backend calls.

use meridian_common::manifest::validate_dns_label;
use meridian_common::{Declaration, Error, NodeId, Result};
use meridian_vault::{SecretExport, SecretRecord};
use tracing::{debug, info};

use crate::capacity::CapacityPolicy;
use crate::cluster::{ClusterDeclaration, ClusterHandle, DEFAULT_KUBERNETES_VERSION};
use crate::controllers::{ControllerDeclaration, ControllerRefs, ControllerSpec};
use crate::database::{DatabaseDeclaration, DatabaseSpec};
use crate::network::NetworkLayout;
use crate::permissions::IdentityDeclaration;

const COMPONENT: &str = "cluster";

/// Declares the cluster, its supporting controllers and the managed database
#[derive(Clone, Debug)]
pub struct ClusterProvisioner {
    name: String,
    region: String,
    account_id: String,
    exports: Vec<SecretExport>,
    kubernetes_version: String,
    cluster: Option<ClusterDeclaration>,
    controllers: Vec<ControllerDeclaration>,
    database: Option<DatabaseDeclaration>,
}

impl ClusterProvisioner {
    /// Start declaring cluster `cluster_name` in `region` of `account_id`
    ///
    /// `exports` are the vault's record identifiers; the cluster is ordered
    /// after every one of them.
    pub fn new(
        cluster_name: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
        exports: &[SecretExport],
    ) -> Result<Self> {
        let name = cluster_name.into();
        let region = region.into();
        let account_id = account_id.into();

        validate_dns_label(COMPONENT, "cluster name", &name)?;
        if region.trim().is_empty() {
            return Err(Error::configuration(COMPONENT, "region must not be empty"));
        }
        if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::configuration(
                COMPONENT,
                format!("account id '{}' must be 12 digits", account_id),
            ));
        }

        Ok(Self {
            name,
            region,
            account_id,
            exports: exports.to_vec(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            cluster: None,
            controllers: Vec::new(),
            database: None,
        })
    }

    /// Override the Kubernetes version
    pub fn with_kubernetes_version(mut self, version: impl Into<String>) -> Self {
        self.kubernetes_version = version.into();
        self
    }

    /// Declare the cluster and its tagged worker capacity
    pub fn provision_cluster(&mut self, capacity: CapacityPolicy) -> Result<ClusterHandle> {
        if self.cluster.is_some() {
            return Err(Error::configuration(
                COMPONENT,
                format!("cluster '{}' already provisioned", self.name),
            ));
        }
        capacity.validate()?;
        let network = NetworkLayout::partition(&capacity.network)?;

        let handle = ClusterHandle::new(&self.name, &self.region, &self.account_id, network);
        let secrets = self.exports.iter().map(SecretExport::node_id).collect();
        let declaration = ClusterDeclaration::new(
            handle.clone(),
            capacity,
            self.kubernetes_version.clone(),
            secrets,
        );

        info!(
            cluster = %handle.name,
            region = %handle.region,
            min = declaration.capacity.min,
            max = declaration.capacity.max,
            "Declared cluster"
        );
        self.cluster = Some(declaration);
        Ok(handle)
    }

    /// Declare the managed database admitting only the cluster's private subnets
    ///
    /// The credential must be the vault's username/password record.
    pub fn provision_database(
        &mut self,
        cluster: &ClusterHandle,
        spec: &DatabaseSpec,
        credential: Option<&SecretRecord>,
    ) -> Result<DatabaseDeclaration> {
        self.require_cluster(cluster)?;
        if self.database.is_some() {
            return Err(Error::configuration("database", "database already provisioned"));
        }
        let credential = credential.ok_or_else(|| {
            Error::configuration(
                "database",
                format!("database '{}' has no credential record", spec.name),
            )
        })?;
        if !self
            .exports
            .iter()
            .any(|e| e.logical_name == credential.logical_name())
        {
            return Err(Error::configuration(
                "database",
                format!(
                    "credential '{}' is not a record of the vault",
                    credential.logical_name()
                ),
            ));
        }

        let declaration = DatabaseDeclaration::new(
            spec.clone(),
            credential.clone(),
            cluster.node_id(),
            cluster.network.private_cidrs(),
        )?;
        debug!(
            database = %spec.name,
            port = spec.port,
            sources = declaration.network_rule.allowed_cidrs.len(),
            "Declared database"
        );
        self.database = Some(declaration.clone());
        Ok(declaration)
    }

    /// Declare a chart-installed controller
    pub fn install_controller(&mut self, spec: ControllerSpec) -> Result<NodeId> {
        let handle = match &self.cluster {
            Some(cluster) => cluster.handle.clone(),
            None => {
                return Err(Error::configuration(
                    COMPONENT,
                    format!("controller '{}' declared before the cluster", spec.name),
                ))
            }
        };
        validate_dns_label(COMPONENT, "controller name", &spec.name)?;
        if self.controllers.iter().any(|c| c.spec.name == spec.name) {
            return Err(Error::configuration(
                COMPONENT,
                format!("controller '{}' installed twice", spec.name),
            ));
        }
        if let Some(missing) = spec
            .after
            .iter()
            .find(|name| !self.controllers.iter().any(|c| &c.spec.name == *name))
        {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "controller '{}' must be installed after '{}', which is not installed",
                    spec.name, missing
                ),
            ));
        }

        let declaration = ControllerDeclaration::new(spec, &handle)?;
        let node = declaration.node_id();
        debug!(
            controller = %declaration.spec.name,
            chart = %declaration.spec.chart.name,
            version = %declaration.spec.chart.version,
            identity = declaration.identity.is_some(),
            "Declared controller"
        );
        self.controllers.push(declaration);
        Ok(node)
    }

    /// Install the full catalog: load balancer, autoscaler, secret sync and monitoring
    pub fn install_default_controllers(&mut self) -> Result<ControllerRefs> {
        let handle = self.cluster_handle().cloned().ok_or_else(|| {
            Error::configuration(COMPONENT, "controllers declared before the cluster")
        })?;
        for spec in [
            ControllerSpec::aws_load_balancer_controller(&handle),
            ControllerSpec::cluster_autoscaler(&handle),
            ControllerSpec::secrets_store_csi_driver(),
            ControllerSpec::secrets_store_csi_provider_aws(),
            ControllerSpec::kube_prometheus_stack(),
        ] {
            self.install_controller(spec)?;
        }
        Ok(self.controller_refs())
    }

    /// Graph nodes of the installed controllers, by role
    pub fn controller_refs(&self) -> ControllerRefs {
        let mut refs = ControllerRefs::default();
        for controller in &self.controllers {
            refs.insert(controller.spec.role, controller.node_id());
        }
        refs
    }

    /// The declared cluster
    pub fn cluster(&self) -> Option<&ClusterDeclaration> {
        self.cluster.as_ref()
    }

    /// Handle of the declared cluster
    pub fn cluster_handle(&self) -> Option<&ClusterHandle> {
        self.cluster.as_ref().map(|c| &c.handle)
    }

    /// Declared controllers in installation order
    pub fn controllers(&self) -> &[ControllerDeclaration] {
        &self.controllers
    }

    /// Identities of controllers that call cloud APIs
    pub fn identities(&self) -> Vec<&IdentityDeclaration> {
        self.controllers
            .iter()
            .filter_map(|c| c.identity.as_ref())
            .collect()
    }

    /// The declared database
    pub fn database(&self) -> Option<&DatabaseDeclaration> {
        self.database.as_ref()
    }

    fn require_cluster(&self, cluster: &ClusterHandle) -> Result<()> {
        match &self.cluster {
            Some(declared) if declared.handle.name == cluster.name => Ok(()),
            Some(declared) => Err(Error::configuration(
                COMPONENT,
                format!(
                    "cluster '{}' is not the provisioned cluster '{}'",
                    cluster.name, declared.handle.name
                ),
            )),
            None => Err(Error::configuration(
                COMPONENT,
                format!("cluster '{}' has not been provisioned", cluster.name),
            )),
        }
    }
}
