//! Secret records and how their values are produced

use std::collections::BTreeMap;

use meridian_common::{Declaration, NodeId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Minimum length of a backend-generated random string
pub const MIN_RANDOM_LENGTH: u32 = 8;
/// Maximum length of a backend-generated random string
pub const MAX_RANDOM_LENGTH: u32 = 4096;

/// How the secret store produces a record's value
///
/// The value itself never passes through this process; the policy only
/// tells the backend what to generate or expect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GenerationPolicy {
    /// Fixed-length random string generated by the backend
    #[serde(rename_all = "camelCase")]
    RandomString {
        /// Number of characters
        length: u32,
        /// Exclude punctuation from the generated string
        #[serde(default)]
        exclude_punctuation: bool,
    },
    /// JSON object with fixed fields plus one backend-generated field
    #[serde(rename_all = "camelCase")]
    JsonTemplate {
        /// Fixed fields (e.g. `username`)
        template: BTreeMap<String, String>,
        /// Field the backend fills with a generated value (e.g. `password`)
        generate_key: String,
    },
    /// Value supplied out-of-band, optionally rotated by the backend
    #[serde(rename_all = "camelCase")]
    External {
        /// Rotation interval in days
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rotation_days: Option<u32>,
    },
}

impl GenerationPolicy {
    /// Random string of `length` characters
    pub fn random(length: u32) -> Self {
        Self::RandomString {
            length,
            exclude_punctuation: false,
        }
    }

    /// Value supplied out-of-band without rotation
    pub fn external() -> Self {
        Self::External {
            rotation_days: None,
        }
    }

    /// Username/password pair with a generated password
    pub fn credential(username: impl Into<String>) -> Self {
        Self::JsonTemplate {
            template: BTreeMap::from([("username".to_string(), username.into())]),
            generate_key: "password".to_string(),
        }
    }

    /// Named fields of the value, empty for a single opaque value
    ///
    /// Template keys come first in key order, then the generated key.
    pub fn fields(&self) -> Vec<String> {
        match self {
            Self::JsonTemplate {
                template,
                generate_key,
            } => template
                .keys()
                .cloned()
                .chain(std::iter::once(generate_key.clone()))
                .collect(),
            Self::RandomString { .. } | Self::External { .. } => Vec::new(),
        }
    }

    /// Check the policy's own parameters
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Self::RandomString { length, .. } => {
                if !(MIN_RANDOM_LENGTH..=MAX_RANDOM_LENGTH).contains(length) {
                    return Err(format!(
                        "random length {} outside {}..={}",
                        length, MIN_RANDOM_LENGTH, MAX_RANDOM_LENGTH
                    ));
                }
            }
            Self::JsonTemplate {
                template,
                generate_key,
            } => {
                if generate_key.is_empty() {
                    return Err("generated key must not be empty".to_string());
                }
                if template.contains_key(generate_key) {
                    return Err(format!(
                        "generated key '{}' also appears in the template",
                        generate_key
                    ));
                }
                if template.keys().any(String::is_empty) {
                    return Err("template keys must not be empty".to_string());
                }
            }
            Self::External { rotation_days } => {
                if *rotation_days == Some(0) {
                    return Err("rotation interval must be at least one day".to_string());
                }
            }
        }
        Ok(())
    }
}

/// One isolated secret value in the secret store
///
/// Immutable once declared; everything downstream refers to it by identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    logical_name: String,
    storage_location: String,
    encryption_key_ref: String,
    generation_policy: GenerationPolicy,
}

impl SecretRecord {
    pub(crate) fn new(
        logical_name: String,
        storage_location: String,
        encryption_key_ref: String,
        generation_policy: GenerationPolicy,
    ) -> Self {
        Self {
            logical_name,
            storage_location,
            encryption_key_ref,
            generation_policy,
        }
    }

    /// Name the record is declared under
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Path in the secret store (`<prefix>/<logical_name>`)
    pub fn storage_location(&self) -> &str {
        &self.storage_location
    }

    /// Key used to encrypt the record at rest
    pub fn encryption_key_ref(&self) -> &str {
        &self.encryption_key_ref
    }

    /// How the value is produced
    pub fn generation_policy(&self) -> &GenerationPolicy {
        &self.generation_policy
    }

    /// Named fields of the value, empty for a single opaque value
    pub fn fields(&self) -> Vec<String> {
        self.generation_policy.fields()
    }

    /// Whether the value is a JSON object with named fields
    pub fn is_multi_field(&self) -> bool {
        !self.fields().is_empty()
    }

    /// Identifier-only view handed to other components
    pub fn export(&self) -> SecretExport {
        SecretExport {
            logical_name: self.logical_name.clone(),
            storage_location: self.storage_location.clone(),
        }
    }
}

impl Declaration for SecretRecord {
    fn node_id(&self) -> NodeId {
        NodeId::secret(&self.logical_name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        Vec::new()
    }
}

/// Identifier of a record, without its policy
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretExport {
    /// Name the record is declared under
    pub logical_name: String,
    /// Path in the secret store
    pub storage_location: String,
}

impl SecretExport {
    /// Graph node of the exported record
    pub fn node_id(&self) -> NodeId {
        NodeId::secret(&self.logical_name)
    }
}
