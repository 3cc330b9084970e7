//! Supporting controllers installed from charts
//!
//! Each controller that calls cloud APIs gets its own identity scoped to
//! exactly its permission set. The catalog below covers the controllers the
//! platform relies on: load balancing, autoscaling, secret sync and
//! monitoring.

use std::collections::BTreeMap;

use meridian_common::{Declaration, Error, NodeId, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cluster::ClusterHandle;
use crate::permissions::{IdentityDeclaration, PermissionSet, ResourceScope, ROLE_ARN_ANNOTATION};

/// Namespace for system controllers
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Namespace for the monitoring stack
pub const MONITORING_NAMESPACE: &str = "monitoring";

/// AWS load balancer controller chart version
const LOAD_BALANCER_CHART_VERSION: &str = "1.8.2";
/// Cluster autoscaler chart version
const AUTOSCALER_CHART_VERSION: &str = "9.43.0";
/// Secrets Store CSI driver chart version
const CSI_DRIVER_CHART_VERSION: &str = "1.4.6";
/// AWS provider for the CSI driver chart version
const CSI_PROVIDER_CHART_VERSION: &str = "0.3.9";
/// Monitoring stack chart version
const MONITORING_CHART_VERSION: &str = "65.1.1";

/// Tag the load balancer controller puts on everything it creates
pub const LOAD_BALANCER_CLUSTER_TAG: &str = "elbv2.k8s.aws/cluster";

/// Chart to install
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Chart repository URL
    pub repository: String,
    /// Chart name
    pub name: String,
    /// Chart version
    pub version: String,
}

impl ChartRef {
    /// Create a chart reference
    pub fn new(
        repository: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// What a controller does for the rest of the graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerRole {
    /// Turns Ingress objects into load balancers
    LoadBalancer,
    /// Scales the node group
    Autoscaler,
    /// Syncs secret-store records into Kubernetes Secrets
    SecretSync,
    /// Metrics and dashboards
    Monitoring,
}

/// A chart-installed controller
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    /// Release name, unique per cluster
    pub name: String,
    /// Chart to install
    pub chart: ChartRef,
    /// Release namespace
    pub namespace: String,
    /// Chart values
    pub values: Value,
    /// Service account the controller runs as
    pub service_account: String,
    /// Cloud permissions; empty when the controller never calls cloud APIs
    pub permissions: PermissionSet,
    /// Role in the platform
    pub role: ControllerRole,
    /// Other controllers that must be installed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl ControllerSpec {
    /// AWS load balancer controller, scoped to load balancers tagged for this cluster
    pub fn aws_load_balancer_controller(cluster: &ClusterHandle) -> Self {
        let name = "aws-load-balancer-controller";
        let owned = ResourceScope::Tagged {
            key: LOAD_BALANCER_CLUSTER_TAG.to_string(),
            value: cluster.name.clone(),
        };
        let permissions = PermissionSet::new()
            .allow(
                &[
                    "ec2:DescribeAccountAttributes",
                    "ec2:DescribeAvailabilityZones",
                    "ec2:DescribeInstances",
                    "ec2:DescribeSecurityGroups",
                    "ec2:DescribeSubnets",
                    "ec2:DescribeVpcs",
                    "elasticloadbalancing:DescribeListeners",
                    "elasticloadbalancing:DescribeLoadBalancers",
                    "elasticloadbalancing:DescribeRules",
                    "elasticloadbalancing:DescribeTags",
                    "elasticloadbalancing:DescribeTargetGroups",
                    "elasticloadbalancing:DescribeTargetHealth",
                    "acm:DescribeCertificate",
                    "acm:ListCertificates",
                ],
                ResourceScope::Unscoped,
            )
            .allow(
                &[
                    "ec2:AuthorizeSecurityGroupIngress",
                    "ec2:RevokeSecurityGroupIngress",
                    "ec2:CreateSecurityGroup",
                    "ec2:DeleteSecurityGroup",
                    "ec2:CreateTags",
                    "elasticloadbalancing:CreateLoadBalancer",
                    "elasticloadbalancing:CreateTargetGroup",
                    "elasticloadbalancing:CreateListener",
                    "elasticloadbalancing:CreateRule",
                    "elasticloadbalancing:ModifyListener",
                    "elasticloadbalancing:ModifyLoadBalancerAttributes",
                    "elasticloadbalancing:ModifyTargetGroup",
                    "elasticloadbalancing:ModifyRule",
                    "elasticloadbalancing:DeleteLoadBalancer",
                    "elasticloadbalancing:DeleteTargetGroup",
                    "elasticloadbalancing:DeleteListener",
                    "elasticloadbalancing:DeleteRule",
                    "elasticloadbalancing:AddTags",
                    "elasticloadbalancing:RegisterTargets",
                    "elasticloadbalancing:DeregisterTargets",
                ],
                owned,
            );

        Self {
            name: name.to_string(),
            chart: ChartRef::new(
                "https://aws.github.io/eks-charts",
                name,
                LOAD_BALANCER_CHART_VERSION,
            ),
            namespace: SYSTEM_NAMESPACE.to_string(),
            values: json!({
                "clusterName": cluster.name,
                "region": cluster.region,
                "serviceAccount": { "create": true, "name": name },
            }),
            service_account: name.to_string(),
            permissions,
            role: ControllerRole::LoadBalancer,
            after: Vec::new(),
        }
    }

    /// Cluster autoscaler, scoped to node groups tagged as owned by this cluster
    pub fn cluster_autoscaler(cluster: &ClusterHandle) -> Self {
        let name = "cluster-autoscaler";
        let permissions = PermissionSet::new()
            .allow(
                &[
                    "autoscaling:DescribeAutoScalingGroups",
                    "autoscaling:DescribeAutoScalingInstances",
                    "autoscaling:DescribeLaunchConfigurations",
                    "autoscaling:DescribeScalingActivities",
                    "autoscaling:DescribeTags",
                    "ec2:DescribeImages",
                    "ec2:DescribeInstanceTypes",
                    "ec2:DescribeLaunchTemplateVersions",
                    "ec2:GetInstanceTypesFromInstanceRequirements",
                    "eks:DescribeNodegroup",
                ],
                ResourceScope::Unscoped,
            )
            .allow(
                &[
                    "autoscaling:SetDesiredCapacity",
                    "autoscaling:TerminateInstanceInAutoScalingGroup",
                ],
                ResourceScope::Tagged {
                    key: crate::capacity::autoscaler_owner_tag(&cluster.name),
                    value: "owned".to_string(),
                },
            );

        Self {
            name: name.to_string(),
            chart: ChartRef::new(
                "https://kubernetes.github.io/autoscaler",
                name,
                AUTOSCALER_CHART_VERSION,
            ),
            namespace: SYSTEM_NAMESPACE.to_string(),
            values: json!({
                "cloudProvider": "aws",
                "awsRegion": cluster.region,
                "autoDiscovery": { "clusterName": cluster.name },
                "rbac": { "serviceAccount": { "create": true, "name": name } },
                "extraArgs": {
                    "balance-similar-node-groups": true,
                    "skip-nodes-with-system-pods": false,
                },
            }),
            service_account: name.to_string(),
            permissions,
            role: ControllerRole::Autoscaler,
            after: Vec::new(),
        }
    }

    /// Secrets Store CSI driver with Kubernetes Secret sync enabled
    ///
    /// The driver reads records with each pod's own identity, so it has no
    /// cloud permissions of its own.
    pub fn secrets_store_csi_driver() -> Self {
        let name = "secrets-store-csi-driver";
        Self {
            name: name.to_string(),
            chart: ChartRef::new(
                "https://kubernetes-sigs.github.io/secrets-store-csi-driver/charts",
                name,
                CSI_DRIVER_CHART_VERSION,
            ),
            namespace: SYSTEM_NAMESPACE.to_string(),
            values: json!({
                "syncSecret": { "enabled": true },
                "enableSecretRotation": true,
            }),
            service_account: name.to_string(),
            permissions: PermissionSet::new(),
            role: ControllerRole::SecretSync,
            after: Vec::new(),
        }
    }

    /// AWS provider for the Secrets Store CSI driver
    pub fn secrets_store_csi_provider_aws() -> Self {
        let name = "secrets-store-csi-driver-provider-aws";
        Self {
            name: name.to_string(),
            chart: ChartRef::new("https://aws.github.io/secrets-store-csi-driver-provider-aws", name, CSI_PROVIDER_CHART_VERSION),
            namespace: SYSTEM_NAMESPACE.to_string(),
            values: json!({
                "secrets-store-csi-driver": { "install": false },
            }),
            service_account: name.to_string(),
            permissions: PermissionSet::new(),
            role: ControllerRole::SecretSync,
            after: vec!["secrets-store-csi-driver".to_string()],
        }
    }

    /// Prometheus, Alertmanager and Grafana
    pub fn kube_prometheus_stack() -> Self {
        let name = "kube-prometheus-stack";
        Self {
            name: name.to_string(),
            chart: ChartRef::new(
                "https://prometheus-community.github.io/helm-charts",
                name,
                MONITORING_CHART_VERSION,
            ),
            namespace: MONITORING_NAMESPACE.to_string(),
            values: json!({
                "grafana": { "enabled": true },
                "prometheus": { "prometheusSpec": { "retention": "15d" } },
            }),
            service_account: name.to_string(),
            permissions: PermissionSet::new(),
            role: ControllerRole::Monitoring,
            after: Vec::new(),
        }
    }

    /// Whether the controller needs a cloud identity
    pub fn needs_identity(&self) -> bool {
        !self.permissions.is_empty()
    }
}

/// A controller bound to its cluster and identity
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerDeclaration {
    /// The controller
    pub spec: ControllerSpec,
    /// Identity the controller runs as, if it calls cloud APIs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityDeclaration>,
    #[serde(skip)]
    cluster: NodeId,
}

impl ControllerDeclaration {
    /// Bind a controller to a cluster, declaring its identity if needed
    ///
    /// The identity's role ARN is injected into the chart values as the
    /// service account annotation.
    pub fn new(mut spec: ControllerSpec, cluster: &ClusterHandle) -> Result<Self> {
        let identity = if spec.needs_identity() {
            let identity = IdentityDeclaration::new(
                &cluster.name,
                &cluster.account_id,
                &spec.namespace,
                &spec.service_account,
                spec.permissions.clone(),
            )?;
            annotate_service_account(&mut spec, &identity.role_arn)?;
            Some(identity)
        } else {
            None
        };

        Ok(Self {
            spec,
            identity,
            cluster: cluster.node_id(),
        })
    }

    /// Graph node of the controller's identity
    pub fn identity_node(&self) -> Option<NodeId> {
        self.identity.as_ref().map(Declaration::node_id)
    }
}

/// Put the role annotation where each chart expects its service account settings
fn annotate_service_account(spec: &mut ControllerSpec, role_arn: &str) -> Result<()> {
    let path: &[&str] = match spec.role {
        ControllerRole::Autoscaler => &["rbac", "serviceAccount"],
        _ => &["serviceAccount"],
    };

    let mut cursor = &mut spec.values;
    for key in path {
        let object = cursor.as_object_mut().ok_or_else(|| {
            Error::configuration(
                "cluster",
                format!("controller {}: chart values must be an object", spec.name),
            )
        })?;
        cursor = object.entry(key.to_string()).or_insert_with(|| json!({}));
    }
    let object = cursor.as_object_mut().ok_or_else(|| {
        Error::configuration(
            "cluster",
            format!("controller {}: service account values must be an object", spec.name),
        )
    })?;
    let annotations = object
        .entry("annotations".to_string())
        .or_insert_with(|| json!({}));
    annotations[ROLE_ARN_ANNOTATION] = json!(role_arn);
    Ok(())
}

impl Declaration for ControllerDeclaration {
    fn node_id(&self) -> NodeId {
        NodeId::controller(&self.spec.name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        let mut deps = vec![self.cluster.clone()];
        deps.extend(self.identity_node());
        deps.extend(self.spec.after.iter().map(|name| NodeId::controller(name)));
        deps
    }
}

/// Graph nodes of installed controllers, by role
///
/// Handed to the workload topology so bindings and routing can wait for the
/// controllers they rely on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerRefs {
    by_role: BTreeMap<ControllerRole, Vec<NodeId>>,
}

impl ControllerRefs {
    /// Record an installed controller
    pub fn insert(&mut self, role: ControllerRole, node: NodeId) {
        let nodes = self.by_role.entry(role).or_default();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }

    /// Controllers with a given role
    pub fn for_role(&self, role: ControllerRole) -> &[NodeId] {
        self.by_role.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Controllers that sync secrets into the cluster
    pub fn secret_sync(&self) -> &[NodeId] {
        self.for_role(ControllerRole::SecretSync)
    }

    /// Controllers that provision load balancers
    pub fn load_balancer(&self) -> &[NodeId] {
        self.for_role(ControllerRole::LoadBalancer)
    }
}
