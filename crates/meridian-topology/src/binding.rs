//! Secret bindings: one vault record synced into one namespaced Secret
//!
//! A binding is declarative. It names the record by storage location and maps
//! either the whole value or each named field to a key of the target Secret.
//! The secret-sync driver performs the transfer at cluster runtime; no value
//! passes through here.
//!
//! Each binding renders to a `SecretProviderClass` for the AWS provider of
//! the Secrets Store CSI driver whose `secretObjects` sync exactly one
//! Kubernetes Secret.

use std::collections::{BTreeMap, BTreeSet};

use meridian_common::manifest::{validate_dns_label, HasApiResource, LABEL_PART_OF};
use meridian_common::{impl_api_defaults, Declaration, Error, Manifest, NodeId, NodeKind, ObjectMeta, Result};
use meridian_vault::SecretRecord;
use serde::{Deserialize, Serialize};

const COMPONENT: &str = "topology";

/// Target key used when binding a single-value record with default naming
pub const DEFAULT_VALUE_KEY: &str = "value";

/// Which part of the record a target key receives
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldSource {
    /// The record's entire opaque value
    WholeValue,
    /// One named field of a multi-field record
    NamedField(String),
}

/// One entry of a binding's field map
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Source part of the record
    pub source: FieldSource,
    /// Key in the target Secret
    pub target_key: String,
}

impl FieldMapping {
    /// Map the whole value to `target_key`
    pub fn whole(target_key: impl Into<String>) -> Self {
        Self {
            source: FieldSource::WholeValue,
            target_key: target_key.into(),
        }
    }

    /// Map the field `field` to `target_key`
    pub fn field(field: impl Into<String>, target_key: impl Into<String>) -> Self {
        Self {
            source: FieldSource::NamedField(field.into()),
            target_key: target_key.into(),
        }
    }
}

/// Identifiers of the bound record
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    /// Vault logical name
    pub logical_name: String,
    /// Storage location in the secret store
    pub storage_location: String,
    /// Key the record is encrypted with
    pub encryption_key_ref: String,
}

/// Field map that binds every part of `record` under its own name
///
/// Single-value records map to [`DEFAULT_VALUE_KEY`]; multi-field records map
/// each field to a key of the same name.
pub fn default_field_map(record: &SecretRecord) -> Vec<FieldMapping> {
    if record.is_multi_field() {
        record
            .fields()
            .into_iter()
            .map(|field| FieldMapping::field(field.clone(), field))
            .collect()
    } else {
        vec![FieldMapping::whole(DEFAULT_VALUE_KEY)]
    }
}

/// A record bound into one namespace as one Secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBinding {
    /// The bound record
    pub source: SecretSource,
    /// Consuming namespace
    pub namespace: String,
    /// Name of the synced Secret (and of its SecretProviderClass)
    pub target_name: String,
    /// Ordered field map
    pub field_map: Vec<FieldMapping>,
    #[serde(skip)]
    requires: Vec<NodeId>,
}

impl SecretBinding {
    /// Bind `record` into `namespace` as the Secret `target_name`
    ///
    /// `requires` are the nodes that must exist before the binding can be
    /// applied besides the namespace and the record (the cluster and the
    /// secret-sync controllers).
    pub(crate) fn new(
        record: &SecretRecord,
        namespace: &str,
        target_name: impl Into<String>,
        field_map: Vec<FieldMapping>,
        requires: Vec<NodeId>,
    ) -> Result<Self> {
        let target_name = target_name.into();
        validate_dns_label(COMPONENT, "binding target name", &target_name)?;
        validate_field_map(record, &target_name, &field_map)?;

        Ok(Self {
            source: SecretSource {
                logical_name: record.logical_name().to_string(),
                storage_location: record.storage_location().to_string(),
                encryption_key_ref: record.encryption_key_ref().to_string(),
            },
            namespace: namespace.to_string(),
            target_name,
            field_map,
            requires,
        })
    }

    /// Keys of the target Secret, in field map order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.field_map.iter().map(|m| m.target_key.as_str())
    }

    /// Whether the target Secret carries `key`
    pub fn has_key(&self, key: &str) -> bool {
        self.keys().any(|k| k == key)
    }

    /// Build the SecretProviderClass for this binding
    pub fn provider_class(&self) -> Result<SecretProviderClass> {
        let object = AwsSecretObject::for_binding(self);
        let objects = serde_yaml::to_string(&vec![object])?;

        let secret_object = SecretObject {
            secret_name: self.target_name.clone(),
            type_: "Opaque".to_string(),
            data: self
                .keys()
                .map(|key| SecretObjectData {
                    object_name: key.to_string(),
                    key: key.to_string(),
                })
                .collect(),
        };

        let metadata = ObjectMeta::new(&self.target_name, &self.namespace)
            .with_label(LABEL_PART_OF, &self.namespace)
            .with_annotation(SOURCE_ANNOTATION, &self.source.logical_name);

        Ok(SecretProviderClass::new(
            metadata,
            SecretProviderClassSpec {
                provider: AWS_PROVIDER.to_string(),
                parameters: BTreeMap::from([("objects".to_string(), objects)]),
                secret_objects: vec![secret_object],
            },
        ))
    }

    /// Render the SecretProviderClass
    pub fn render(&self) -> Result<Manifest> {
        let class = self.provider_class()?;
        Manifest::typed(&class, &class.metadata)
    }
}

impl Declaration for SecretBinding {
    fn node_id(&self) -> NodeId {
        NodeId::namespaced(NodeKind::SecretBinding, &self.namespace, &self.target_name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        let mut deps = vec![
            NodeId::namespace(&self.namespace),
            NodeId::secret(&self.source.logical_name),
        ];
        for node in &self.requires {
            if !deps.contains(node) {
                deps.push(node.clone());
            }
        }
        deps
    }
}

fn validate_field_map(record: &SecretRecord, target: &str, field_map: &[FieldMapping]) -> Result<()> {
    let fail = |msg: String| {
        Error::configuration(
            COMPONENT,
            format!("binding '{}' of '{}': {}", target, record.logical_name(), msg),
        )
    };

    let mut keys = BTreeSet::new();
    for mapping in field_map {
        if !is_secret_key(&mapping.target_key) {
            return Err(fail(format!(
                "target key '{}' must consist of alphanumerics, '-', '_' or '.'",
                mapping.target_key
            )));
        }
        if !keys.insert(mapping.target_key.as_str()) {
            return Err(fail(format!("target key '{}' is mapped twice", mapping.target_key)));
        }
    }

    if !record.is_multi_field() {
        return match field_map {
            [FieldMapping {
                source: FieldSource::WholeValue,
                ..
            }] => Ok(()),
            _ => Err(fail(
                "a single-value record takes exactly one whole-value entry".to_string(),
            )),
        };
    }

    let fields = record.fields();
    let mut mapped = BTreeSet::new();
    for mapping in field_map {
        match &mapping.source {
            FieldSource::WholeValue => {
                return Err(fail(
                    "a multi-field record must be bound field by field".to_string(),
                ))
            }
            FieldSource::NamedField(field) if !fields.contains(field) => {
                return Err(fail(format!("record has no field '{}'", field)));
            }
            FieldSource::NamedField(field) => {
                if !mapped.insert(field.as_str()) {
                    return Err(fail(format!("field '{}' is mapped twice", field)));
                }
            }
        }
    }
    if mapped.len() != fields.len() {
        let missing: Vec<&String> = fields.iter().filter(|f| !mapped.contains(f.as_str())).collect();
        return Err(fail(format!("fields {:?} are not mapped", missing)));
    }
    Ok(())
}

fn is_secret_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 253
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// =============================================================================
// SecretProviderClass
// =============================================================================

/// Provider name of the AWS secret-store provider
pub const AWS_PROVIDER: &str = "aws";

/// Annotation naming the vault record a binding syncs
pub const SOURCE_ANNOTATION: &str = "meridian.dev/secret-source";

/// Secrets Store CSI driver SecretProviderClass
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClass {
    /// API version
    #[serde(default = "SecretProviderClass::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "SecretProviderClass::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Class specification
    pub spec: SecretProviderClassSpec,
}

impl HasApiResource for SecretProviderClass {
    const API_VERSION: &'static str = "secrets-store.csi.x-k8s.io/v1";
    const KIND: &'static str = "SecretProviderClass";
}

impl_api_defaults!(SecretProviderClass);

impl SecretProviderClass {
    /// Create a new SecretProviderClass
    pub fn new(metadata: ObjectMeta, spec: SecretProviderClassSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// SecretProviderClass spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretProviderClassSpec {
    /// Provider plugin
    pub provider: String,
    /// Provider parameters; `objects` holds a YAML list of objects to fetch
    pub parameters: BTreeMap<String, String>,
    /// Kubernetes Secrets to sync from the mounted objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_objects: Vec<SecretObject>,
}

/// Kubernetes Secret synced from mounted objects
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretObject {
    /// Secret name
    pub secret_name: String,
    /// Secret type
    #[serde(rename = "type")]
    pub type_: String,
    /// Keys of the Secret
    pub data: Vec<SecretObjectData>,
}

/// One key of a synced Secret
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretObjectData {
    /// Mounted object (alias) the key is read from
    pub object_name: String,
    /// Key in the Secret
    pub key: String,
}

/// Entry of the AWS provider's `objects` parameter
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsSecretObject {
    /// Secret name or ARN in the store
    pub object_name: String,
    /// Store type
    pub object_type: String,
    /// File name of the whole value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_alias: Option<String>,
    /// Fields extracted from a JSON value
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jmes_path: Vec<JmesPath>,
}

/// Field extracted from a JSON record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JmesPath {
    /// Field path
    pub path: String,
    /// File name of the field
    pub object_alias: String,
}

impl AwsSecretObject {
    fn for_binding(binding: &SecretBinding) -> Self {
        let mut object = Self {
            object_name: binding.source.storage_location.clone(),
            object_type: "secretsmanager".to_string(),
            object_alias: None,
            jmes_path: Vec::new(),
        };
        for mapping in &binding.field_map {
            match &mapping.source {
                FieldSource::WholeValue => object.object_alias = Some(mapping.target_key.clone()),
                FieldSource::NamedField(field) => object.jmes_path.push(JmesPath {
                    path: field.clone(),
                    object_alias: mapping.target_key.clone(),
                }),
            }
        }
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn bind(record: &SecretRecord, target: &str, map: Vec<FieldMapping>) -> Result<SecretBinding> {
        SecretBinding::new(record, "apps", target, map, vec![NodeId::cluster("prod")])
    }

    #[test]
    fn single_value_binding_takes_one_whole_value_entry() {
        let vault = vault();
        let record = vault.require("admin-password").expect("declared");

        let binding = bind(record, "admin-password", vec![FieldMapping::whole("password")])
            .expect("valid binding");
        assert_eq!(binding.keys().collect::<Vec<_>>(), vec!["password"]);

        assert!(bind(record, "admin-password", vec![]).is_err());
        assert!(bind(
            record,
            "admin-password",
            vec![FieldMapping::whole("a"), FieldMapping::whole("b")]
        )
        .is_err());
        assert!(bind(record, "admin-password", vec![FieldMapping::field("value", "value")]).is_err());
    }

    /// Story: the database credential is bound as two fields of one record
    #[test]
    fn story_credential_pair_binds_field_by_field() {
        let vault = vault();
        let record = vault.require("docdb-credential").expect("declared");

        let binding = bind(record, "docdb-credential", default_field_map(record))
            .expect("default map covers both fields");
        assert_eq!(binding.keys().collect::<Vec<_>>(), vec!["username", "password"]);

        let err = bind(
            record,
            "docdb-credential",
            vec![FieldMapping::field("username", "user")],
        )
        .expect_err("password unmapped");
        assert!(err.to_string().contains("password"));

        let err = bind(
            record,
            "docdb-credential",
            vec![
                FieldMapping::field("username", "same"),
                FieldMapping::field("password", "same"),
            ],
        )
        .expect_err("duplicate target key");
        assert!(err.is_configuration());

        assert!(bind(record, "docdb-credential", vec![FieldMapping::whole("value")]).is_err());
    }

    #[test]
    fn dependencies_cover_namespace_record_and_requirements() {
        let vault = vault();
        let record = vault.require("admin-password").expect("declared");
        let binding = SecretBinding::new(
            record,
            "apps",
            "admin-password",
            default_field_map(record),
            vec![
                NodeId::cluster("prod"),
                NodeId::controller("secrets-store-csi-driver"),
                NodeId::cluster("prod"),
            ],
        )
        .expect("valid");

        assert_eq!(
            binding.node_id(),
            NodeId::namespaced(NodeKind::SecretBinding, "apps", "admin-password")
        );
        assert_eq!(
            binding.dependencies(),
            vec![
                NodeId::namespace("apps"),
                NodeId::secret("admin-password"),
                NodeId::cluster("prod"),
                NodeId::controller("secrets-store-csi-driver"),
            ]
        );
    }

    #[test]
    fn provider_class_syncs_exactly_one_secret() {
        let vault = vault();
        let record = vault.require("docdb-credential").expect("declared");
        let binding = bind(record, "docdb-credential", default_field_map(record)).expect("valid");

        let class = binding.provider_class().expect("renders");
        assert_eq!(class.api_version, "secrets-store.csi.x-k8s.io/v1");
        assert_eq!(class.spec.provider, "aws");
        assert_eq!(class.spec.secret_objects.len(), 1);
        assert_eq!(class.spec.secret_objects[0].secret_name, "docdb-credential");

        let objects: Vec<AwsSecretObject> =
            serde_yaml::from_str(&class.spec.parameters["objects"]).expect("objects parse");
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_name, "meridian/prod/docdb-credential");
        assert_eq!(objects[0].jmes_path.len(), 2);
        assert!(objects[0].object_alias.is_none());
    }

    #[test]
    fn rendering_is_deterministic() {
        let vault = vault();
        let record = vault.require("admin-password").expect("declared");
        let binding = bind(record, "admin-password", default_field_map(record)).expect("valid");

        let first = binding.render().expect("renders");
        let second = binding.render().expect("renders");
        assert_eq!(first, second);
        assert_eq!(first.kind, "SecretProviderClass");
        assert_eq!(first.namespace.as_deref(), Some("apps"));
        assert!(first.yaml.contains("objectAlias: value"));
        assert!(!first.yaml.contains("docdb"));
    }

    #[test]
    fn rejects_invalid_target_names_and_keys() {
        let vault = vault();
        let record = vault.require("admin-password").expect("declared");
        assert!(bind(record, "Admin_Password", default_field_map(record)).is_err());
        assert!(bind(record, "admin-password", vec![FieldMapping::whole("bad key")]).is_err());
    }
}
