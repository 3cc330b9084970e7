//! Managed document database
//!
//! The database master credential is generated by the backend and stored in
//! the vault's credential record; no password is ever passed inline. Network
//! access is limited to the cluster's private subnets on the database port.

use meridian_common::{Declaration, Error, NodeId, NodeKind, Result};
use meridian_vault::SecretRecord;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const COMPONENT: &str = "database";

/// Default port of the document database
pub const DEFAULT_DATABASE_PORT: u16 = 27017;

/// Requested database
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Database cluster name
    pub name: String,
    /// Instance type
    pub instance_class: String,
    /// Number of instances
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Listener port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Engine version, backend default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

fn default_instances() -> u32 {
    1
}

fn default_port() -> u16 {
    DEFAULT_DATABASE_PORT
}

impl DatabaseSpec {
    pub(crate) fn validate(&self) -> Result<()> {
        meridian_common::manifest::validate_dns_label(COMPONENT, "database name", &self.name)?;
        if self.instance_class.trim().is_empty() {
            return Err(Error::configuration(COMPONENT, "instance class must not be empty"));
        }
        if self.instances == 0 {
            return Err(Error::configuration(COMPONENT, "at least one instance required"));
        }
        if self.port == 0 {
            return Err(Error::configuration(COMPONENT, "port must be non-zero"));
        }
        Ok(())
    }
}

/// How the master credential is produced
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CredentialPolicy {
    /// Backend generates the password and stores it in the credential record
    #[serde(rename_all = "camelCase")]
    GenerateAndStore {
        /// Storage location of the credential record
        storage_location: String,
        /// Field holding the username
        username_field: String,
        /// Field holding the generated password
        password_field: String,
    },
}

/// Network scope admitting cluster traffic to the database
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseNetworkRule {
    /// Rule name
    pub name: String,
    /// Database port
    pub port: u16,
    /// Source ranges (the cluster's private subnets)
    pub allowed_cidrs: Vec<String>,
    #[serde(skip)]
    cluster: NodeId,
}

impl Declaration for DatabaseNetworkRule {
    fn node_id(&self) -> NodeId {
        NodeId::new(NodeKind::DatabaseNetworkRule, &self.name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        vec![self.cluster.clone()]
    }
}

/// The database node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDeclaration {
    /// Requested database
    pub spec: DatabaseSpec,
    /// Credential record
    pub credential: SecretRecord,
    /// How the credential is produced
    pub credential_policy: CredentialPolicy,
    /// Network rule, created first
    pub network_rule: DatabaseNetworkRule,
}

impl DatabaseDeclaration {
    pub(crate) fn new(
        spec: DatabaseSpec,
        credential: SecretRecord,
        cluster: NodeId,
        private_cidrs: Vec<String>,
    ) -> Result<Self> {
        spec.validate()?;

        let fields = credential.fields();
        let [username_field, password_field] = fields.as_slice() else {
            return Err(Error::configuration(
                COMPONENT,
                format!(
                    "credential '{}' must be a username/password pair",
                    credential.logical_name()
                ),
            ));
        };
        if private_cidrs.is_empty() {
            return Err(Error::configuration(
                COMPONENT,
                "cluster has no private subnets to admit",
            ));
        }

        Ok(Self {
            credential_policy: CredentialPolicy::GenerateAndStore {
                storage_location: credential.storage_location().to_string(),
                username_field: username_field.clone(),
                password_field: password_field.clone(),
            },
            network_rule: DatabaseNetworkRule {
                name: spec.name.clone(),
                port: spec.port,
                allowed_cidrs: private_cidrs,
                cluster,
            },
            spec,
            credential,
        })
    }
}

impl Declaration for DatabaseDeclaration {
    fn node_id(&self) -> NodeId {
        NodeId::new(NodeKind::Database, &self.spec.name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        vec![
            self.network_rule.node_id(),
            NodeId::secret(self.credential.logical_name()),
        ]
    }
}

/// Database endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseEndpoint {
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
}

/// A created database
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseHandle {
    /// Where to connect
    pub endpoint: DatabaseEndpoint,
    /// Record holding the master credential
    pub credential: SecretRecord,
}

impl DatabaseHandle {
    /// Create a handle; a missing credential is a configuration error
    pub fn new(endpoint: DatabaseEndpoint, credential: Option<SecretRecord>) -> Result<Self> {
        let credential = credential.ok_or_else(|| {
            Error::configuration(
                COMPONENT,
                format!(
                    "database at {}:{} has no credential record",
                    endpoint.host, endpoint.port
                ),
            )
        })?;
        Ok(Self {
            endpoint,
            credential,
        })
    }
}
