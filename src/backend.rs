//! Backend interfaces the scheduler evaluates the graph against
//!
//! The cluster control plane, the secret store, the chart installer and the
//! database engine are external collaborators. They are reached only through
//! these traits so the graph can be evaluated against real clients, the
//! recording backend used by `meridian plan --simulate`, or mocks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_cluster::permissions::role_name;
use meridian_cluster::{
    ChartRef, ClusterDeclaration, ClusterHandle, CredentialPolicy, DatabaseEndpoint,
    DatabaseNetworkRule, DatabaseSpec, PermissionSet,
};
use meridian_common::{Error, Manifest, Result};
use meridian_topology::SecretBinding;
use meridian_vault::SecretRecord;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Secret storage backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create the record (generating its value per its policy)
    ///
    /// Returns the store's identifier for the record.
    async fn create_secret(&self, record: &SecretRecord) -> Result<String>;

    /// Make a stored record available to the sync driver in `namespace`
    ///
    /// Returns the name of the synced Secret.
    async fn bind_secret_to_namespace(
        &self,
        secret_id: &str,
        namespace: &str,
        binding: &SecretBinding,
    ) -> Result<String>;

    /// Read the current value of a stored record
    ///
    /// Used for values the graph needs at apply time, such as the Ingress
    /// host name.
    async fn resolve_reference(&self, secret_id: &str) -> Result<String>;
}

/// Cluster control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the cluster and its worker capacity
    async fn create_cluster(&self, cluster: &ClusterDeclaration) -> Result<ClusterHandle>;

    /// Install a chart release
    async fn install_chart(
        &self,
        cluster: &ClusterHandle,
        chart: &ChartRef,
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> Result<()>;

    /// Apply one rendered manifest
    async fn apply_manifest(&self, cluster: &ClusterHandle, manifest: &Manifest) -> Result<()>;

    /// Create a cloud identity bound to the service account `namespace/name`
    ///
    /// Returns the identity's reference (role ARN).
    async fn grant_identity(
        &self,
        cluster: &ClusterHandle,
        name: &str,
        namespace: &str,
        permissions: &PermissionSet,
    ) -> Result<String>;
}

/// Managed database engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseApi: Send + Sync {
    /// Create the network scope admitting the rule's sources
    ///
    /// Returns the scope's reference.
    async fn create_network_scope(&self, rule: &DatabaseNetworkRule) -> Result<String>;

    /// Create the database cluster inside `scope`
    async fn create_cluster(
        &self,
        scope: &str,
        spec: &DatabaseSpec,
        credential: &CredentialPolicy,
    ) -> Result<DatabaseEndpoint>;
}

/// The three backends the scheduler needs
#[derive(Clone)]
pub struct Backends {
    /// Secret storage
    pub secrets: Arc<dyn SecretStore>,
    /// Cluster control plane
    pub cluster: Arc<dyn ClusterApi>,
    /// Database engine
    pub database: Arc<dyn DatabaseApi>,
}

impl Backends {
    /// Use one value for all three backends
    pub fn single<B>(backend: Arc<B>) -> Self
    where
        B: SecretStore + ClusterApi + DatabaseApi + 'static,
    {
        Self {
            secrets: backend.clone(),
            cluster: backend.clone(),
            database: backend,
        }
    }
}

// =============================================================================
// Recording backend
// =============================================================================

/// A backend call as recorded by [`RecordingBackend`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    /// `create_secret`
    CreateSecret {
        /// Storage location
        location: String,
    },
    /// `bind_secret_to_namespace`
    BindSecret {
        /// Namespace
        namespace: String,
        /// Synced Secret name
        target: String,
    },
    /// `resolve_reference`
    ResolveReference {
        /// Storage location
        location: String,
    },
    /// `create_cluster` on the cluster API
    CreateCluster {
        /// Cluster name
        name: String,
    },
    /// `install_chart`
    InstallChart {
        /// Release name
        release: String,
        /// Release namespace
        namespace: String,
    },
    /// `apply_manifest`
    ApplyManifest {
        /// Resource kind
        kind: String,
        /// Target namespace
        namespace: Option<String>,
        /// Resource name
        name: String,
    },
    /// `grant_identity`
    GrantIdentity {
        /// Service account namespace
        namespace: String,
        /// Service account name
        name: String,
    },
    /// `create_network_scope`
    CreateNetworkScope {
        /// Rule name
        name: String,
    },
    /// `create_cluster` on the database API
    CreateDatabase {
        /// Database name
        name: String,
    },
}

impl BackendCall {
    /// Name of the object the call acts on
    pub fn target(&self) -> &str {
        match self {
            Self::CreateSecret { location } => location,
            Self::BindSecret { target, .. } => target,
            Self::ResolveReference { location } => location,
            Self::CreateCluster { name } => name,
            Self::InstallChart { release, .. } => release,
            Self::ApplyManifest { name, .. } => name,
            Self::GrantIdentity { name, .. } => name,
            Self::CreateNetworkScope { name } => name,
            Self::CreateDatabase { name } => name,
        }
    }
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateSecret { location } => write!(f, "create secret {}", location),
            Self::BindSecret { namespace, target } => {
                write!(f, "bind secret {}/{}", namespace, target)
            }
            Self::ResolveReference { location } => write!(f, "resolve secret {}", location),
            Self::CreateCluster { name } => write!(f, "create cluster {}", name),
            Self::InstallChart { release, namespace } => {
                write!(f, "install chart {}/{}", namespace, release)
            }
            Self::ApplyManifest {
                kind,
                namespace,
                name,
            } => match namespace {
                Some(ns) => write!(f, "apply {} {}/{}", kind, ns, name),
                None => write!(f, "apply {} {}", kind, name),
            },
            Self::GrantIdentity { namespace, name } => {
                write!(f, "grant identity {}/{}", namespace, name)
            }
            Self::CreateNetworkScope { name } => write!(f, "create network scope {}", name),
            Self::CreateDatabase { name } => write!(f, "create database {}", name),
        }
    }
}

/// Backend that records every call and answers with deterministic values
///
/// Calls whose target is listed in `fail_on` return `BackendUnavailable`.
/// Resolving a record with no configured value answers
/// `<last path segment>.recorded.test`.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    fail_on: BTreeSet<String>,
    values: BTreeMap<String, String>,
}

impl RecordingBackend {
    /// Backend where every call succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail calls acting on `target`
    pub fn failing_on(mut self, target: impl Into<String>) -> Self {
        self.fail_on.insert(target.into());
        self
    }

    /// Answer `value` when the record stored at `location` is resolved
    pub fn with_value(mut self, location: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(location.into(), value.into());
        self
    }

    /// Calls recorded so far, in order
    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, backend: &str, call: BackendCall) -> Result<()> {
        debug!(backend, call = %call, "Backend call");
        let fails = self.fail_on.contains(call.target());
        let target = call.target().to_string();
        self.calls.lock().await.push(call);
        if fails {
            return Err(Error::backend(backend, target, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for RecordingBackend {
    async fn create_secret(&self, record: &SecretRecord) -> Result<String> {
        self.record(
            "secret-store",
            BackendCall::CreateSecret {
                location: record.storage_location().to_string(),
            },
        )
        .await?;
        Ok(format!("secret:{}", record.storage_location()))
    }

    async fn bind_secret_to_namespace(
        &self,
        _secret_id: &str,
        namespace: &str,
        binding: &SecretBinding,
    ) -> Result<String> {
        self.record(
            "secret-store",
            BackendCall::BindSecret {
                namespace: namespace.to_string(),
                target: binding.target_name.clone(),
            },
        )
        .await?;
        Ok(binding.target_name.clone())
    }

    async fn resolve_reference(&self, secret_id: &str) -> Result<String> {
        let location = secret_id.strip_prefix("secret:").unwrap_or(secret_id);
        self.record(
            "secret-store",
            BackendCall::ResolveReference {
                location: location.to_string(),
            },
        )
        .await?;
        Ok(self.values.get(location).cloned().unwrap_or_else(|| {
            let name = location.rsplit('/').next().unwrap_or(location);
            format!("{}.recorded.test", name)
        }))
    }
}

#[async_trait]
impl ClusterApi for RecordingBackend {
    async fn create_cluster(&self, cluster: &ClusterDeclaration) -> Result<ClusterHandle> {
        let name = cluster.handle.name.clone();
        self.record("cluster", BackendCall::CreateCluster { name: name.clone() })
            .await?;
        Ok(cluster
            .handle
            .clone()
            .with_endpoint(format!("https://{}.{}.eks.amazonaws.com", name, cluster.handle.region)))
    }

    async fn install_chart(
        &self,
        _cluster: &ClusterHandle,
        _chart: &ChartRef,
        release: &str,
        namespace: &str,
        _values: &Value,
    ) -> Result<()> {
        self.record(
            "cluster",
            BackendCall::InstallChart {
                release: release.to_string(),
                namespace: namespace.to_string(),
            },
        )
        .await
    }

    async fn apply_manifest(&self, _cluster: &ClusterHandle, manifest: &Manifest) -> Result<()> {
        self.record(
            "cluster",
            BackendCall::ApplyManifest {
                kind: manifest.kind.clone(),
                namespace: manifest.namespace.clone(),
                name: manifest.name.clone(),
            },
        )
        .await
    }

    async fn grant_identity(
        &self,
        cluster: &ClusterHandle,
        name: &str,
        namespace: &str,
        _permissions: &PermissionSet,
    ) -> Result<String> {
        self.record(
            "cluster",
            BackendCall::GrantIdentity {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
        )
        .await?;
        Ok(format!(
            "arn:aws:iam::{}:role/{}",
            cluster.account_id,
            role_name(&cluster.name, namespace, name)
        ))
    }
}

#[async_trait]
impl DatabaseApi for RecordingBackend {
    async fn create_network_scope(&self, rule: &DatabaseNetworkRule) -> Result<String> {
        self.record(
            "database",
            BackendCall::CreateNetworkScope {
                name: rule.name.clone(),
            },
        )
        .await?;
        Ok(format!("scope:{}", rule.name))
    }

    async fn create_cluster(
        &self,
        _scope: &str,
        spec: &DatabaseSpec,
        _credential: &CredentialPolicy,
    ) -> Result<DatabaseEndpoint> {
        self.record(
            "database",
            BackendCall::CreateDatabase {
                name: spec.name.clone(),
            },
        )
        .await?;
        Ok(DatabaseEndpoint {
            host: format!("{}.cluster.docdb.amazonaws.com", spec.name),
            port: spec.port,
        })
    }
}
