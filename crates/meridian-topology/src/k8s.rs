//! Kubernetes resource types for workload compilation
//!
//! Namespace, ServiceAccount, Service and Ingress come from `k8s-openapi`.
//! The pod-level types below are our own so the compiled Deployment only
//! carries the fields we set, in a stable shape.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as K8sObjectMeta;
use meridian_common::manifest::HasApiResource;
use meridian_common::{impl_api_defaults, ObjectMeta};
use serde::{Deserialize, Serialize};

/// Driver name of the Secrets Store CSI driver
pub const CSI_DRIVER: &str = "secrets-store.csi.k8s.io";

/// Convert our metadata into the `k8s-openapi` form
///
/// Empty label and annotation maps are left unset so the rendered YAML
/// matches the hand-rolled resources.
pub fn object_meta(meta: &ObjectMeta) -> K8sObjectMeta {
    K8sObjectMeta {
        name: Some(meta.name.clone()),
        namespace: meta.namespace.clone(),
        labels: (!meta.labels.is_empty()).then(|| meta.labels.clone()),
        annotations: (!meta.annotations.is_empty()).then(|| meta.annotations.clone()),
        ..Default::default()
    }
}

// =============================================================================
// Deployment
// =============================================================================

/// Kubernetes Deployment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// API version
    #[serde(default = "Deployment::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Deployment::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: DeploymentSpec,
}

impl HasApiResource for Deployment {
    const API_VERSION: &'static str = "apps/v1";
    const KIND: &'static str = "Deployment";
}

impl_api_defaults!(Deployment);

impl Deployment {
    /// Create a Deployment
    pub fn new(metadata: ObjectMeta, spec: DeploymentSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// Deployment spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Number of replicas
    pub replicas: u32,
    /// Label selector
    pub selector: LabelSelector,
    /// Pod template
    pub template: PodTemplateSpec,
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels to match; empty selects everything
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

/// Pod template
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    /// Pod metadata
    pub metadata: PodMeta,
    /// Pod spec
    pub spec: PodSpec,
}

/// Pod template metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Pod spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Service account the pods run as
    pub service_account_name: String,
    /// Containers
    pub containers: Vec<Container>,
    /// Volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

// =============================================================================
// Container
// =============================================================================

/// Container spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name
    pub name: String,
    /// Image
    pub image: String,
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Container port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number
    pub container_port: u16,
    /// Protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Environment variable sourced from a Kubernetes Secret key
///
/// Workload variables never carry literal values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Secret key reference
    pub value_from: EnvVarSource,
}

impl EnvVar {
    /// Create an env var that references a secret key
    pub fn from_secret(
        name: impl Into<String>,
        secret_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value_from: EnvVarSource {
                secret_key_ref: SecretKeySelector {
                    name: secret_name.into(),
                    key: key.into(),
                },
            },
        }
    }
}

/// Source for an environment variable value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    /// Reference to a specific key in a Kubernetes Secret
    pub secret_key_ref: SecretKeySelector,
}

/// Selector for a key within a Kubernetes Secret
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SecretKeySelector {
    /// Name of the Secret
    pub name: String,
    /// Key within the Secret
    pub key: String,
}

// =============================================================================
// Volumes
// =============================================================================

/// Volume backed by the Secrets Store CSI driver
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// CSI source
    pub csi: CsiVolumeSource,
}

impl Volume {
    /// Create a volume that mounts a SecretProviderClass
    pub fn from_provider_class(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            csi: CsiVolumeSource {
                driver: CSI_DRIVER.to_string(),
                read_only: true,
                volume_attributes: BTreeMap::from([(
                    "secretProviderClass".to_string(),
                    class_name.into(),
                )]),
            },
        }
    }
}

/// CSI volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeSource {
    /// Driver name
    pub driver: String,
    /// Mount read-only
    pub read_only: bool,
    /// Driver attributes
    pub volume_attributes: BTreeMap<String, String>,
}

/// Volume mount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Mount path
    pub mount_path: String,
    /// Mount read-only
    pub read_only: bool,
}

// =============================================================================
// NetworkPolicy
// =============================================================================

/// Kubernetes NetworkPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// API version
    #[serde(default = "NetworkPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "NetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: NetworkPolicySpec,
}

impl HasApiResource for NetworkPolicy {
    const API_VERSION: &'static str = "networking.k8s.io/v1";
    const KIND: &'static str = "NetworkPolicy";
}

impl_api_defaults!(NetworkPolicy);

impl NetworkPolicy {
    /// Create a NetworkPolicy
    pub fn new(metadata: ObjectMeta, spec: NetworkPolicySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// NetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Pods the policy applies to
    pub pod_selector: LabelSelector,
    /// Policy directions
    pub policy_types: Vec<String>,
    /// Allowed ingress; empty denies everything
    #[serde(default)]
    pub ingress: Vec<NetworkPolicyIngressRule>,
}

/// One allowed ingress rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyIngressRule {
    /// Allowed peers
    pub from: Vec<NetworkPolicyPeer>,
    /// Allowed ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

/// Allowed peer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    /// Address range
    pub ip_block: IpBlock,
}

/// Address range of a peer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IpBlock {
    /// CIDR
    pub cidr: String,
}

/// Allowed port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NetworkPolicyPort {
    /// Protocol
    pub protocol: String,
    /// Port number
    pub port: u16,
}
