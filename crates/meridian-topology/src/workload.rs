//! Workload units: a Deployment + Service pair and its service account
//!
//! Environment variables are resolved only through `(target secret, key)`
//! pairs of bindings the workload mounts. A mounted binding becomes a CSI
//! volume; mounting is what makes the driver sync the target Secret, so an
//! env reference to an unmounted binding is rejected when the unit is built.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use meridian_common::manifest::{validate_dns_label, LABEL_NAME, LABEL_PART_OF};
use meridian_common::{Declaration, Error, Manifest, NodeId, NodeKind, ObjectMeta, Result};
use meridian_cluster::permissions::ROLE_ARN_ANNOTATION;
use meridian_cluster::IdentityDeclaration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::binding::SecretBinding;
use crate::k8s::{
    object_meta, Container, ContainerPort, Deployment, DeploymentSpec, EnvVar, LabelSelector,
    PodMeta, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};

const COMPONENT: &str = "topology";

/// Availability floor for every workload
pub const MIN_REPLICAS: u32 = 2;

/// Default container port
pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// Directory under which mounted bindings appear inside the container
pub const SECRET_MOUNT_ROOT: &str = "/mnt/secrets";

/// Environment variable read from a key of a mounted binding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvBinding {
    /// Variable name
    pub name: String,
    /// Target secret name of the binding
    pub secret: String,
    /// Key within the target secret
    pub key: String,
}

/// One logical service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Service name
    pub name: String,
    /// Container image reference
    pub image: String,
    /// Port the container listens on
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// Replica count, at least two
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Path prefix routed to this workload, unrouted when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Bindings mounted into the pods, by target secret name
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Environment variables sourced from mounted bindings
    #[serde(default)]
    pub env: Vec<EnvBinding>,
}

fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

fn default_replicas() -> u32 {
    MIN_REPLICAS
}

impl WorkloadSpec {
    /// Workload with default port and replicas and nothing mounted
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            container_port: DEFAULT_CONTAINER_PORT,
            replicas: MIN_REPLICAS,
            path_prefix: None,
            mounts: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Route `prefix` to this workload
    pub fn routed(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Mount the binding `target` and read `key` from it into `variable`
    pub fn with_env(
        mut self,
        variable: impl Into<String>,
        target: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        let target = target.into();
        if !self.mounts.contains(&target) {
            self.mounts.push(target.clone());
        }
        self.env.push(EnvBinding {
            name: variable.into(),
            secret: target,
            key: key.into(),
        });
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_dns_label(COMPONENT, "workload name", &self.name)?;
        let fail = |msg: String| Error::configuration(COMPONENT, format!("workload {}: {}", self.name, msg));

        if self.image.trim().is_empty() {
            return Err(fail("image must not be empty".to_string()));
        }
        if self.container_port == 0 {
            return Err(fail("container port must be non-zero".to_string()));
        }
        if self.replicas < MIN_REPLICAS {
            return Err(fail(format!(
                "replicas {} below the availability floor of {}",
                self.replicas, MIN_REPLICAS
            )));
        }

        let mut mounts = BTreeSet::new();
        if let Some(dup) = self.mounts.iter().find(|m| !mounts.insert(m.as_str())) {
            return Err(fail(format!("binding '{}' mounted twice", dup)));
        }
        let mut names = BTreeSet::new();
        for var in &self.env {
            if !is_env_name(&var.name) {
                return Err(fail(format!("'{}' is not a valid variable name", var.name)));
            }
            if !names.insert(var.name.as_str()) {
                return Err(fail(format!("variable '{}' defined twice", var.name)));
            }
            if !mounts.contains(var.secret.as_str()) {
                return Err(fail(format!(
                    "variable '{}' reads binding '{}', which is not mounted",
                    var.name, var.secret
                )));
            }
        }
        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Progress of one workload unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum WorkloadState {
    /// Declared, bindings not yet resolved
    Declared,
    /// Every mounted binding exists
    Bound,
    /// Cluster, namespace, identity and bindings all exist
    Deployable,
    /// Manifests applied
    Deployed,
}

/// Deployment + Service pair applied as one unit
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadUnit {
    /// The workload
    pub spec: WorkloadSpec,
    /// Namespace it runs in
    pub namespace: String,
    /// Mounted bindings, in mount order
    pub bindings: Vec<SecretBinding>,
    /// Identity allowed to read the mounted records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityDeclaration>,
    state: WorkloadState,
    #[serde(skip)]
    cluster: NodeId,
}

impl WorkloadUnit {
    /// Build a unit from a validated spec and its resolved bindings
    pub(crate) fn new(
        spec: WorkloadSpec,
        namespace: &str,
        bindings: Vec<SecretBinding>,
        identity: Option<IdentityDeclaration>,
        cluster: NodeId,
    ) -> Result<Self> {
        spec.validate()?;
        for var in &spec.env {
            let binding = bindings
                .iter()
                .find(|b| b.target_name == var.secret)
                .ok_or_else(|| {
                    Error::configuration(
                        COMPONENT,
                        format!("workload {}: binding '{}' is not declared", spec.name, var.secret),
                    )
                })?;
            if !binding.has_key(&var.key) {
                return Err(Error::configuration(
                    COMPONENT,
                    format!(
                        "workload {}: variable '{}' reads key '{}', which binding '{}' does not map",
                        spec.name, var.name, var.key, var.secret
                    ),
                ));
            }
        }

        Ok(Self {
            spec,
            namespace: namespace.to_string(),
            bindings,
            identity,
            state: WorkloadState::Declared,
            cluster,
        })
    }

    /// Current state
    pub fn state(&self) -> WorkloadState {
        self.state
    }

    /// Whether the unit may be applied
    pub fn is_deployable(&self) -> bool {
        self.state == WorkloadState::Deployable
    }

    /// Service account the pods run as
    pub fn service_account_name(&self) -> &str {
        &self.spec.name
    }

    /// Dependencies that have not completed yet
    pub fn missing(&self, completed: &BTreeSet<NodeId>) -> Vec<NodeId> {
        self.dependencies()
            .into_iter()
            .filter(|node| !completed.contains(node))
            .collect()
    }

    /// Move to the furthest state the completed nodes allow
    ///
    /// A deployed unit stays deployed.
    pub fn advance(&mut self, completed: &BTreeSet<NodeId>) -> WorkloadState {
        if self.state == WorkloadState::Deployed {
            return self.state;
        }
        let bound = self
            .bindings
            .iter()
            .all(|b| completed.contains(&b.node_id()));
        self.state = if !bound {
            WorkloadState::Declared
        } else if self.missing(completed).is_empty() {
            WorkloadState::Deployable
        } else {
            WorkloadState::Bound
        };
        self.state
    }

    /// Record that the manifests were applied
    pub fn mark_deployed(&mut self) -> Result<()> {
        match self.state {
            WorkloadState::Deployable | WorkloadState::Deployed => {
                self.state = WorkloadState::Deployed;
                Ok(())
            }
            state => Err(Error::dependency_unsatisfied(
                self.node_id().to_string(),
                format!("workload is {:?}, not Deployable", state),
            )),
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_NAME.to_string(), self.spec.name.clone())])
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta::new(&self.spec.name, &self.namespace).with_label(LABEL_PART_OF, &self.namespace)
    }

    /// Service account carrying the identity annotation
    pub fn service_account(&self) -> ServiceAccount {
        let mut meta = self.metadata();
        if let Some(identity) = &self.identity {
            meta = meta.with_annotation(ROLE_ARN_ANNOTATION, &identity.role_arn);
        }
        ServiceAccount {
            metadata: object_meta(&meta),
            ..Default::default()
        }
    }

    /// Deployment mounting every binding as a CSI volume
    pub fn deployment(&self) -> Deployment {
        let volumes = self
            .bindings
            .iter()
            .map(|b| Volume::from_provider_class(&b.target_name, &b.target_name))
            .collect();
        let volume_mounts = self
            .bindings
            .iter()
            .map(|b| VolumeMount {
                name: b.target_name.clone(),
                mount_path: format!("{}/{}", SECRET_MOUNT_ROOT, b.target_name),
                read_only: true,
            })
            .collect();
        let env = self
            .spec
            .env
            .iter()
            .map(|var| EnvVar::from_secret(&var.name, &var.secret, &var.key))
            .collect();

        let container = Container {
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            ports: vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: self.spec.container_port,
                protocol: Some("TCP".to_string()),
            }],
            env,
            volume_mounts,
        };

        let mut pod_labels = self.labels();
        pod_labels.insert(LABEL_PART_OF.to_string(), self.namespace.clone());

        Deployment::new(
            self.metadata(),
            DeploymentSpec {
                replicas: self.spec.replicas,
                selector: LabelSelector {
                    match_labels: self.labels(),
                },
                template: PodTemplateSpec {
                    metadata: PodMeta { labels: pod_labels },
                    spec: PodSpec {
                        service_account_name: self.service_account_name().to_string(),
                        containers: vec![container],
                        volumes,
                    },
                },
            },
        )
    }

    /// ClusterIP service in front of the pods
    pub fn service(&self) -> Service {
        let port = i32::from(self.spec.container_port);
        Service {
            metadata: object_meta(&self.metadata()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Render service account, Deployment and Service, in apply order
    pub fn render(&self) -> Result<Vec<Manifest>> {
        let ns = Some(self.namespace.as_str());
        let deployment = self.deployment();
        Ok(vec![
            Manifest::render("ServiceAccount", &self.spec.name, ns, &self.service_account())?,
            Manifest::typed(&deployment, &deployment.metadata)?,
            Manifest::render("Service", &self.spec.name, ns, &self.service())?,
        ])
    }
}

impl Declaration for WorkloadUnit {
    fn node_id(&self) -> NodeId {
        NodeId::namespaced(NodeKind::Workload, &self.namespace, &self.spec.name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        let mut deps = vec![NodeId::namespace(&self.namespace), self.cluster.clone()];
        deps.extend(self.bindings.iter().map(Declaration::node_id));
        deps.extend(self.identity.as_ref().map(Declaration::node_id));
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::default_field_map;
    use meridian_vault::{GenerationPolicy, SecretVault};

    fn vault() -> SecretVault {
        let mut builder = SecretVault::builder("meridian/prod", "alias/meridian");
        builder
            .declare_secret("admin-password", GenerationPolicy::random(32))
            .expect("valid");
        builder
            .declare_secret("docdb-credential", GenerationPolicy::credential("docdbadmin"))
            .expect("valid");
        builder.build().expect("vault builds")
    }

    fn bindings(vault: &SecretVault) -> Vec<SecretBinding> {
        vault
            .records()
            .iter()
            .map(|r| {
                SecretBinding::new(r, "apps", r.logical_name(), default_field_map(r), vec![])
                    .expect("valid binding")
            })
            .collect()
    }

    fn api_spec() -> WorkloadSpec {
        WorkloadSpec::new("api", "registry.example.com/api:1.4.2")
            .routed("/api/*")
            .with_env("DB_USER", "docdb-credential", "username")
            .with_env("DB_PASSWORD", "docdb-credential", "password")
    }

    fn unit(spec: WorkloadSpec) -> Result<WorkloadUnit> {
        let vault = vault();
        let mounted = bindings(&vault)
            .into_iter()
            .filter(|b| spec.mounts.contains(&b.target_name))
            .collect();
        WorkloadUnit::new(spec, "apps", mounted, None, NodeId::cluster("prod"))
    }

    #[test]
    fn spec_defaults_from_yaml() {
        let spec: WorkloadSpec =
            serde_yaml::from_str("name: web\nimage: nginx:1.27\n").expect("parses");
        assert_eq!(spec.replicas, 2);
        assert_eq!(spec.container_port, 8080);
        assert!(spec.mounts.is_empty());
    }

    #[test]
    fn replicas_below_floor_are_rejected() {
        let mut spec = WorkloadSpec::new("web", "nginx:1.27");
        spec.replicas = 1;
        let err = unit(spec).expect_err("single replica");
        assert!(err.is_configuration());

        let mut spec = WorkloadSpec::new("web", "nginx:1.27");
        spec.replicas = 5;
        assert_eq!(unit(spec).expect("valid").deployment().spec.replicas, 5);
    }

    /// Story: an env reference to an unmounted binding fails before anything is applied
    #[test]
    fn story_unmounted_env_reference_is_a_configuration_error() {
        let mut spec = api_spec();
        spec.mounts.clear();
        let err = unit(spec).expect_err("not mounted");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("not mounted"));

        let spec = WorkloadSpec::new("api", "api:1").with_env("DB_HOST", "docdb-credential", "host");
        let err = unit(spec).expect_err("unknown key");
        assert!(err.to_string().contains("'host'"));
    }

    #[test]
    fn env_names_must_be_unique_and_valid() {
        let spec = WorkloadSpec::new("api", "api:1")
            .with_env("DB_USER", "docdb-credential", "username")
            .with_env("DB_USER", "docdb-credential", "password");
        assert!(unit(spec).is_err());

        let spec = WorkloadSpec::new("api", "api:1").with_env("1BAD", "admin-password", "value");
        assert!(unit(spec).is_err());
    }

    #[test]
    fn deployment_reads_env_through_secret_key_refs_only() {
        let unit = unit(api_spec()).expect("valid");
        let deployment = unit.deployment();
        let pod = &deployment.spec.template.spec;

        assert_eq!(pod.service_account_name, "api");
        assert_eq!(pod.volumes.len(), 1);
        assert_eq!(
            pod.volumes[0].csi.volume_attributes["secretProviderClass"],
            "docdb-credential"
        );
        let container = &pod.containers[0];
        assert_eq!(container.volume_mounts[0].mount_path, "/mnt/secrets/docdb-credential");
        assert_eq!(container.env.len(), 2);
        assert_eq!(container.env[0].value_from.secret_key_ref.name, "docdb-credential");
        assert_eq!(container.env[1].value_from.secret_key_ref.key, "password");
    }

    /// Story: a workload advances through its states as its dependencies complete
    #[test]
    fn story_state_machine_follows_completed_nodes() {
        let mut unit = unit(api_spec()).expect("valid");
        assert_eq!(unit.state(), WorkloadState::Declared);
        assert!(unit.mark_deployed().is_err());

        let mut completed = BTreeSet::new();
        completed.insert(NodeId::namespace("apps"));
        assert_eq!(unit.advance(&completed), WorkloadState::Declared);

        completed.insert(NodeId::namespaced(NodeKind::SecretBinding, "apps", "docdb-credential"));
        assert_eq!(unit.advance(&completed), WorkloadState::Bound);
        assert_eq!(unit.missing(&completed), vec![NodeId::cluster("prod")]);

        completed.insert(NodeId::cluster("prod"));
        assert_eq!(unit.advance(&completed), WorkloadState::Deployable);
        unit.mark_deployed().expect("deployable");
        assert_eq!(unit.advance(&BTreeSet::new()), WorkloadState::Deployed);
    }

    #[test]
    fn renders_service_account_deployment_and_service() {
        let unit = unit(api_spec()).expect("valid");
        let manifests = unit.render().expect("renders");
        let kinds: Vec<&str> = manifests.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ServiceAccount", "Deployment", "Service"]);

        let service = &manifests[2].yaml;
        assert!(service.contains("type: ClusterIP"));
        assert!(service.contains("port: 8080"));
        assert_eq!(manifests, unit.render().expect("renders again"));
    }
}
