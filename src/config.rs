//! Platform configuration file
//!
//! One YAML document describes the vault, the cluster, the optional database
//! and the workload topology. It is parsed here and turned into declarations
//! by [`Platform::build`](crate::platform::Platform::build).

use std::path::Path;

use meridian_cluster::{CapacityPolicy, DatabaseSpec};
use meridian_common::{Error, Result};
use meridian_topology::{RouteValue, WorkloadSpec};
use meridian_vault::GenerationPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Everything needed to declare a platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    /// Secret records
    pub vault: VaultConfig,
    /// Cluster and controllers
    pub cluster: ClusterConfig,
    /// Managed document database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
    /// Namespace, workloads and routing
    pub topology: TopologyConfig,
}

/// Secret records of the vault
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Storage location prefix, e.g. `meridian/prod`
    pub prefix: String,
    /// Encryption key every record uses
    pub encryption_key_ref: String,
    /// One entry per sensitive value
    pub secrets: Vec<SecretConfig>,
}

/// One secret record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfig {
    /// Logical name
    pub name: String,
    /// How the value is produced
    pub policy: GenerationPolicy,
}

/// Cluster identity and capacity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Cloud region
    pub region: String,
    /// Cloud account id (12 digits)
    pub account_id: String,
    /// Kubernetes version, provisioner default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Worker capacity and network
    pub capacity: CapacityPolicy,
    /// Which catalog controllers to install
    #[serde(default)]
    pub controllers: ControllerToggles,
}

/// Catalog controllers to install; all enabled by default
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerToggles {
    /// AWS load balancer controller
    #[serde(default = "enabled")]
    pub load_balancer: bool,
    /// Cluster autoscaler
    #[serde(default = "enabled")]
    pub autoscaler: bool,
    /// Secrets Store CSI driver and its AWS provider
    #[serde(default = "enabled")]
    pub secret_sync: bool,
    /// Prometheus monitoring stack
    #[serde(default = "enabled")]
    pub monitoring: bool,
}

fn enabled() -> bool {
    true
}

impl Default for ControllerToggles {
    fn default() -> Self {
        Self {
            load_balancer: true,
            autoscaler: true,
            secret_sync: true,
            monitoring: true,
        }
    }
}

/// Database and the vault record holding its master credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database shape
    #[serde(flatten)]
    pub spec: DatabaseSpec,
    /// Logical name of the credential record
    pub credential: String,
}

/// Workload namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConfig {
    /// Namespace name
    pub namespace: String,
    /// Public host name of the Ingress, literal or `{fromSecret: name}`
    pub host: RouteValue,
    /// TLS certificate the load balancer serves, literal or `{fromSecret: name}`
    pub certificate_ref: RouteValue,
    /// Source ranges admitted by the network policy; the cluster's public
    /// subnets when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_sources: Vec<String>,
    /// Workloads in declaration order
    pub workloads: Vec<WorkloadSpec>,
}

impl PlatformConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// JSON schema of the configuration file
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(PlatformConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
vault:
  prefix: meridian/dev
  encryptionKeyRef: alias/meridian-dev
  secrets:
    - name: admin-password
      policy:
        type: randomString
        length: 24
cluster:
  name: dev
  region: us-west-2
  accountId: "123456789012"
  capacity:
    instanceClass: t3.large
    desired: 2
    min: 1
    max: 3
    network:
      vpcCidr: 10.1.0.0/16
      zones: [us-west-2a, us-west-2b, us-west-2c]
topology:
  namespace: apps
  host: dev.example.com
  certificateRef: arn:aws:acm:us-west-2:123456789012:certificate/dev
  workloads:
    - name: web
      image: nginx:1.27
      pathPrefix: /
"#;

    #[test]
    fn parses_with_defaults() {
        let config = PlatformConfig::from_yaml(MINIMAL).expect("valid config");
        assert_eq!(config.vault.secrets.len(), 1);
        assert!(config.database.is_none());
        assert_eq!(config.cluster.controllers, ControllerToggles::default());
        assert_eq!(config.cluster.capacity.network.subnet_prefix, 20);
        assert_eq!(config.topology.workloads[0].replicas, 2);
        assert!(config.topology.allowed_sources.is_empty());
    }

    #[test]
    fn parses_flattened_database() {
        let yaml = format!(
            "{}database:\n  name: docs\n  instanceClass: db.r6g.large\n  credential: docdb-credential\n",
            MINIMAL
        );
        let config = PlatformConfig::from_yaml(&yaml).expect("valid config");
        let database = config.database.expect("database present");
        assert_eq!(database.spec.name, "docs");
        assert_eq!(database.spec.port, 27017);
        assert_eq!(database.credential, "docdb-credential");
    }

    #[test]
    fn route_values_accept_record_references() {
        let yaml = MINIMAL
            .replace("host: dev.example.com", "host:\n    fromSecret: admin-password")
            .replace(
                "certificateRef: arn:aws:acm:us-west-2:123456789012:certificate/dev",
                "certificateRef: { fromSecret: admin-password }",
            );
        let config = PlatformConfig::from_yaml(&yaml).expect("valid config");
        assert_eq!(config.topology.host, RouteValue::from_secret("admin-password"));
        assert_eq!(config.topology.certificate_ref.secret(), Some("admin-password"));

        let literal = PlatformConfig::from_yaml(MINIMAL).expect("valid config");
        assert_eq!(literal.topology.host, RouteValue::from("dev.example.com"));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = PlatformConfig::from_yaml("vault: [").expect_err("malformed");
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(PlatformConfig::from_file("/nonexistent/platform.yaml")
            .expect_err("missing file")
            .is_configuration());
    }

    #[test]
    fn schema_names_every_section() {
        let schema = PlatformConfig::json_schema().expect("schema renders");
        for key in ["vault", "cluster", "database", "topology", "certificateRef"] {
            assert!(schema.contains(key), "schema lacks {}", key);
        }
    }
}
