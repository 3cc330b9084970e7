//! Worker capacity and autoscaler discovery

use std::collections::BTreeMap;

use meridian_common::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::network::NetworkSpec;

/// Autoscaler annotation keys on the CAPI node group
pub const AUTOSCALER_MIN_SIZE: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-min-size";
/// Autoscaler annotation key for the upper bound
pub const AUTOSCALER_MAX_SIZE: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-max-size";

/// Cloud tag marking a node group as autoscaler-managed
pub const AUTOSCALER_ENABLED_TAG: &str = "k8s.io/cluster-autoscaler/enabled";

/// Cloud tag the autoscaler uses to find a cluster's node groups
pub fn autoscaler_owner_tag(cluster: &str) -> String {
    format!("k8s.io/cluster-autoscaler/{}", cluster)
}

/// Worker capacity of the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityPolicy {
    /// Instance type of worker nodes
    pub instance_class: String,
    /// Initial node count
    pub desired: u32,
    /// Lower bound the autoscaler keeps
    pub min: u32,
    /// Upper bound the autoscaler may reach
    pub max: u32,
    /// Network boundary
    pub network: NetworkSpec,
}

impl CapacityPolicy {
    /// Check node counts and instance class
    pub fn validate(&self) -> Result<()> {
        if self.instance_class.trim().is_empty() {
            return Err(Error::configuration("cluster", "instance class must not be empty"));
        }
        if self.min < 1 {
            return Err(Error::configuration("cluster", "minimum node count must be at least 1"));
        }
        if !(self.min <= self.desired && self.desired <= self.max) {
            return Err(Error::configuration(
                "cluster",
                format!(
                    "node counts must satisfy min <= desired <= max, got {} <= {} <= {}",
                    self.min, self.desired, self.max
                ),
            ));
        }
        Ok(())
    }

    /// Cloud tags applied to the node group so the autoscaler discovers it
    pub fn autoscaler_tags(&self, cluster: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (AUTOSCALER_ENABLED_TAG.to_string(), "true".to_string()),
            (autoscaler_owner_tag(cluster), "owned".to_string()),
        ])
    }

    /// CAPI annotations carrying the autoscaler bounds
    pub fn autoscaler_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (AUTOSCALER_MIN_SIZE.to_string(), self.min.to_string()),
            (AUTOSCALER_MAX_SIZE.to_string(), self.max.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(desired: u32, min: u32, max: u32) -> CapacityPolicy {
        CapacityPolicy {
            instance_class: "m6i.large".to_string(),
            desired,
            min,
            max,
            network: NetworkSpec {
                vpc_cidr: "10.0.0.0/16".to_string(),
                zones: vec!["a".into(), "b".into(), "c".into()],
                subnet_prefix: 20,
            },
        }
    }

    #[test]
    fn accepts_ordered_bounds() {
        assert!(policy(3, 2, 6).validate().is_ok());
        assert!(policy(2, 2, 2).validate().is_ok());
    }

    #[test]
    fn rejects_unordered_bounds() {
        assert!(policy(1, 2, 6).validate().is_err());
        assert!(policy(7, 2, 6).validate().is_err());
        assert!(policy(0, 0, 6).validate().is_err());
    }

    #[test]
    fn tags_and_annotations_name_the_cluster_and_bounds() {
        let policy = policy(3, 2, 6);
        let tags = policy.autoscaler_tags("prod");
        assert_eq!(tags.get(AUTOSCALER_ENABLED_TAG), Some(&"true".to_string()));
        assert_eq!(
            tags.get("k8s.io/cluster-autoscaler/prod"),
            Some(&"owned".to_string())
        );

        let annotations = policy.autoscaler_annotations();
        assert_eq!(annotations.get(AUTOSCALER_MIN_SIZE), Some(&"2".to_string()));
        assert_eq!(annotations.get(AUTOSCALER_MAX_SIZE), Some(&"6".to_string()));
    }
}
