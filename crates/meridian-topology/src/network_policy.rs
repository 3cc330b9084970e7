//! Default-deny ingress for the workload namespace
//!
//! Only the load balancer's address ranges may reach the routed ports. The
//! policy is declared after routing so the entry point it protects exists
//! before anything is restricted. A namespace with nothing routed gets a
//! policy without ingress rules, which denies all ingress.

use std::str::FromStr;

use meridian_cluster::network::Ipv4Cidr;
use meridian_common::manifest::LABEL_PART_OF;
use meridian_common::{Declaration, Error, Manifest, NodeId, NodeKind, ObjectMeta, Result};
use serde::Serialize;

use crate::k8s::{
    IpBlock, LabelSelector, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};

/// Deny-all-ingress-except policy for one namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyDeclaration {
    /// Protected namespace
    pub namespace: String,
    /// Source ranges allowed in
    pub allowed_sources: Vec<String>,
    /// Ports those sources may reach
    pub ports: Vec<u16>,
    #[serde(skip)]
    requires: Vec<NodeId>,
}

impl NetworkPolicyDeclaration {
    /// Declare the policy; `requires` must include the routing node when
    /// `ports` is non-empty
    pub(crate) fn new(
        namespace: &str,
        allowed_sources: &[String],
        ports: Vec<u16>,
        requires: Vec<NodeId>,
    ) -> Result<Self> {
        if allowed_sources.is_empty() {
            return Err(Error::configuration(
                "network-policy",
                "at least one allowed source range is required",
            ));
        }
        let mut sources = Vec::with_capacity(allowed_sources.len());
        for raw in allowed_sources {
            let cidr = Ipv4Cidr::from_str(raw)?;
            let normalised = cidr.to_string();
            if !sources.contains(&normalised) {
                sources.push(normalised);
            }
        }

        Ok(Self {
            namespace: namespace.to_string(),
            allowed_sources: sources,
            ports,
            requires,
        })
    }

    /// Name of the NetworkPolicy
    pub fn name(&self) -> String {
        format!("{}-ingress", self.namespace)
    }

    /// Build the NetworkPolicy selecting every pod in the namespace
    pub fn policy(&self) -> NetworkPolicy {
        let ingress = (!self.ports.is_empty()).then(|| NetworkPolicyIngressRule {
            from: self
                .allowed_sources
                .iter()
                .map(|cidr| NetworkPolicyPeer {
                    ip_block: IpBlock { cidr: cidr.clone() },
                })
                .collect(),
            ports: self
                .ports
                .iter()
                .map(|port| NetworkPolicyPort {
                    protocol: "TCP".to_string(),
                    port: *port,
                })
                .collect(),
        });

        NetworkPolicy::new(
            ObjectMeta::new(self.name(), &self.namespace).with_label(LABEL_PART_OF, &self.namespace),
            NetworkPolicySpec {
                pod_selector: LabelSelector::default(),
                policy_types: vec!["Ingress".to_string()],
                ingress: ingress.into_iter().collect(),
            },
        )
    }

    /// Render the NetworkPolicy
    pub fn render(&self) -> Result<Manifest> {
        let policy = self.policy();
        Manifest::typed(&policy, &policy.metadata)
    }
}

impl Declaration for NetworkPolicyDeclaration {
    fn node_id(&self) -> NodeId {
        NodeId::new(NodeKind::NetworkPolicy, &self.namespace)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        let mut deps = vec![NodeId::namespace(&self.namespace)];
        for node in &self.requires {
            if !deps.contains(node) {
                deps.push(node.clone());
            }
        }
        deps
    }
}
