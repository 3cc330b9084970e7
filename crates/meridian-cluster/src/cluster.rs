//! The managed cluster and its CAPI manifests
//!
//! The cluster is declared as a Cluster-API topology: a `Cluster` backed by an
//! `AWSManagedControlPlane`, plus one `MachinePool`/`AWSManagedMachinePool`
//! pair for worker capacity. Autoscaler discovery tags and min/max annotations
//! are rendered into the node group itself, so tagging happens in the same
//! step as capacity creation.

use std::collections::BTreeMap;

use meridian_common::manifest::{LABEL_PART_OF, ObjectMeta};
use meridian_common::{Declaration, Manifest, NodeId, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capacity::CapacityPolicy;
use crate::network::{NetworkLayout, SubnetTier};

/// CAPI core API version
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
/// CAPA control plane API version
pub const CAPA_CONTROL_PLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta2";
/// CAPA infrastructure API version
pub const CAPA_INFRASTRUCTURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta2";

/// Namespace holding the CAPI objects on the management cluster
pub const CAPI_NAMESPACE: &str = "meridian-system";

/// Kubernetes version used when none is configured
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.31.0";

/// Opaque reference to the provisioned cluster plus its network boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHandle {
    /// Cluster name
    pub name: String,
    /// Cloud region
    pub region: String,
    /// Cloud account
    pub account_id: String,
    /// Partitioned network
    pub network: NetworkLayout,
    /// API endpoint, known once the backend has created the cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ClusterHandle {
    /// Create a handle for a declared (not yet created) cluster
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
        network: NetworkLayout,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            account_id: account_id.into(),
            network,
            endpoint: None,
        }
    }

    /// Set the API endpoint reported by the backend
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Graph node of the cluster
    pub fn node_id(&self) -> NodeId {
        NodeId::cluster(&self.name)
    }
}

/// Generic CAPI manifest with an untyped spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapiManifest {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

impl CapiManifest {
    fn new(api_version: &str, kind: &str, name: &str, cluster: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            metadata: ObjectMeta::new(name, CAPI_NAMESPACE)
                .with_label(LABEL_PART_OF, cluster)
                .with_label("cluster.x-k8s.io/cluster-name", cluster),
            spec: None,
        }
    }

    fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.metadata.annotations.extend(annotations);
        self
    }

    /// Render to a manifest document
    pub fn render(&self) -> Result<Manifest> {
        Manifest::render(
            &self.kind,
            &self.metadata.name,
            self.metadata.namespace.as_deref(),
            self,
        )
    }
}

/// The cluster node: control plane, network and tagged worker capacity
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeclaration {
    /// Handle of the declared cluster
    pub handle: ClusterHandle,
    /// Worker capacity
    pub capacity: CapacityPolicy,
    /// Kubernetes version
    pub kubernetes_version: String,
    #[serde(skip)]
    secrets: Vec<NodeId>,
}

impl ClusterDeclaration {
    pub(crate) fn new(
        handle: ClusterHandle,
        capacity: CapacityPolicy,
        kubernetes_version: String,
        secrets: Vec<NodeId>,
    ) -> Self {
        Self {
            handle,
            capacity,
            kubernetes_version,
            secrets,
        }
    }

    /// Name of the worker node group
    pub fn node_group_name(&self) -> String {
        format!("{}-workers", self.handle.name)
    }

    /// Cloud tags on the node group, including autoscaler discovery
    pub fn node_group_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.capacity.autoscaler_tags(&self.handle.name);
        tags.insert("meridian.io/cluster".to_string(), self.handle.name.clone());
        tags
    }

    /// CAPI objects describing the cluster
    pub fn capi_manifests(&self) -> Vec<CapiManifest> {
        let name = &self.handle.name;
        let network = &self.handle.network;
        let subnets: Vec<serde_json::Value> = network
            .subnets
            .iter()
            .map(|s| {
                json!({
                    "availabilityZone": s.zone,
                    "cidrBlock": s.cidr,
                    "isPublic": s.tier == SubnetTier::Public,
                })
            })
            .collect();

        let cluster = CapiManifest::new(CAPI_API_VERSION, "Cluster", name, name).with_spec(json!({
            "controlPlaneRef": {
                "apiVersion": CAPA_CONTROL_PLANE_API_VERSION,
                "kind": "AWSManagedControlPlane",
                "name": format!("{}-control-plane", name),
            },
            "infrastructureRef": {
                "apiVersion": CAPA_INFRASTRUCTURE_API_VERSION,
                "kind": "AWSManagedCluster",
                "name": name,
            },
        }));

        let managed_cluster =
            CapiManifest::new(CAPA_INFRASTRUCTURE_API_VERSION, "AWSManagedCluster", name, name)
                .with_spec(json!({}));

        let control_plane = CapiManifest::new(
            CAPA_CONTROL_PLANE_API_VERSION,
            "AWSManagedControlPlane",
            &format!("{}-control-plane", name),
            name,
        )
        .with_spec(json!({
            "eksClusterName": name,
            "region": self.handle.region,
            "version": self.kubernetes_version,
            "network": {
                "vpc": { "cidrBlock": network.vpc_cidr },
                "subnets": subnets,
            },
            "endpointAccess": { "public": true, "private": true },
        }));

        let pool_name = self.node_group_name();
        let machine_pool = CapiManifest::new(CAPI_API_VERSION, "MachinePool", &pool_name, name)
            .with_annotations(self.capacity.autoscaler_annotations())
            .with_spec(json!({
                "clusterName": name,
                "replicas": self.capacity.desired,
                "template": {
                    "spec": {
                        "clusterName": name,
                        "version": self.kubernetes_version,
                        "bootstrap": { "dataSecretName": "" },
                        "infrastructureRef": {
                            "apiVersion": CAPA_INFRASTRUCTURE_API_VERSION,
                            "kind": "AWSManagedMachinePool",
                            "name": pool_name,
                        },
                    },
                },
            }));

        let managed_pool = CapiManifest::new(
            CAPA_INFRASTRUCTURE_API_VERSION,
            "AWSManagedMachinePool",
            &pool_name,
            name,
        )
        .with_spec(json!({
            "eksNodegroupName": pool_name,
            "instanceType": self.capacity.instance_class,
            "availabilityZones": network.zones(),
            "scaling": {
                "minSize": self.capacity.min,
                "maxSize": self.capacity.max,
            },
            "additionalTags": self.node_group_tags(),
        }));

        vec![cluster, managed_cluster, control_plane, machine_pool, managed_pool]
    }

    /// Render the CAPI objects
    pub fn render(&self) -> Result<Vec<Manifest>> {
        self.capi_manifests().iter().map(CapiManifest::render).collect()
    }
}

impl Declaration for ClusterDeclaration {
    fn node_id(&self) -> NodeId {
        self.handle.node_id()
    }

    /// The cluster waits for every vault record so identifiers can be passed through
    fn dependencies(&self) -> Vec<NodeId> {
        self.secrets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{AUTOSCALER_MAX_SIZE, AUTOSCALER_MIN_SIZE};
    use crate::network::NetworkSpec;

    fn declaration() -> ClusterDeclaration {
        let spec = NetworkSpec {
            vpc_cidr: "10.0.0.0/16".to_string(),
            zones: vec!["us-east-1a".into(), "us-east-1b".into(), "us-east-1c".into()],
            subnet_prefix: 20,
        };
        let network = NetworkLayout::partition(&spec).expect("fits");
        ClusterDeclaration::new(
            ClusterHandle::new("prod", "us-east-1", "123456789012", network),
            CapacityPolicy {
                instance_class: "m6i.large".to_string(),
                desired: 3,
                min: 2,
                max: 6,
                network: spec,
            },
            DEFAULT_KUBERNETES_VERSION.to_string(),
            vec![NodeId::secret("domain-name")],
        )
    }

    #[test]
    fn renders_cluster_control_plane_and_pool() {
        let kinds: Vec<String> = declaration()
            .capi_manifests()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                "Cluster",
                "AWSManagedCluster",
                "AWSManagedControlPlane",
                "MachinePool",
                "AWSManagedMachinePool"
            ]
        );
    }

    /// Story: autoscaler discovery is part of the node group itself
    ///
    /// The tags and bounds are rendered into the same objects that create
    /// capacity, so no separate tagging step can run out of order.
    #[test]
    fn story_node_group_carries_autoscaler_discovery() {
        let manifests = declaration().capi_manifests();

        let pool = manifests
            .iter()
            .find(|m| m.kind == "MachinePool")
            .expect("machine pool rendered");
        assert_eq!(pool.metadata.annotations.get(AUTOSCALER_MIN_SIZE), Some(&"2".to_string()));
        assert_eq!(pool.metadata.annotations.get(AUTOSCALER_MAX_SIZE), Some(&"6".to_string()));
        assert_eq!(pool.spec.as_ref().map(|s| s["replicas"].clone()), Some(json!(3)));

        let managed = manifests
            .iter()
            .find(|m| m.kind == "AWSManagedMachinePool")
            .and_then(|m| m.spec.clone())
            .expect("managed pool spec");
        assert_eq!(managed["additionalTags"]["k8s.io/cluster-autoscaler/enabled"], "true");
        assert_eq!(managed["additionalTags"]["k8s.io/cluster-autoscaler/prod"], "owned");
        assert_eq!(managed["scaling"]["minSize"], 2);
    }

    #[test]
    fn control_plane_carries_the_partitioned_network() {
        let manifests = declaration().capi_manifests();
        let spec = manifests
            .iter()
            .find(|m| m.kind == "AWSManagedControlPlane")
            .and_then(|m| m.spec.clone())
            .expect("control plane spec");
        assert_eq!(spec["network"]["vpc"]["cidrBlock"], "10.0.0.0/16");
        assert_eq!(spec["network"]["subnets"].as_array().map(Vec::len), Some(6));
        assert_eq!(spec["network"]["subnets"][0]["isPublic"], true);
        assert_eq!(spec["network"]["subnets"][3]["isPublic"], false);
    }

    #[test]
    fn cluster_waits_for_vault_records() {
        let decl = declaration();
        assert_eq!(decl.node_id(), NodeId::cluster("prod"));
        assert_eq!(decl.dependencies(), vec![NodeId::secret("domain-name")]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let first = declaration().render().expect("renders");
        let second = declaration().render().expect("renders");
        assert_eq!(first, second);
        assert!(first[0].yaml.contains("kind: Cluster"));
        assert_eq!(first[0].namespace.as_deref(), Some(CAPI_NAMESPACE));
    }
}
