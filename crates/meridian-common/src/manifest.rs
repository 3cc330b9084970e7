//! Manifest rendering helpers
//!
//! Every Kubernetes object the platform applies is built as a typed struct
//! (either a `k8s-openapi` type or one of our own CRD structs) and rendered
//! to YAML here. Rendering is deterministic: maps are ordered and nothing
//! time-dependent is emitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Label carrying the resource's own name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label carrying the tool that manages the resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`] for resources Meridian creates
pub const LABEL_MANAGED_BY_MERIDIAN: &str = "meridian";
/// Label grouping every resource of one platform
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Trait for types with a compile-time API version and kind
pub trait HasApiResource {
    /// API version (group/version, or just version for core resources)
    const API_VERSION: &'static str;
    /// Resource kind
    const KIND: &'static str;
}

/// Generate serde default functions for `apiVersion`/`kind` from [`HasApiResource`]
#[macro_export]
macro_rules! impl_api_defaults {
    ($type:ty) => {
        impl $type {
            fn default_api_version() -> String {
                <Self as $crate::manifest::HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as $crate::manifest::HasApiResource>::KIND.to_string()
            }
        }
    };
}

/// Metadata for the typed resources we define ourselves
///
/// Automatically carries the standard name and managed-by labels.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace (absent for cluster-scoped resources)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create namespaced metadata with standard labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut meta = Self::cluster_scoped(name);
        meta.namespace = Some(namespace.into());
        meta
    }

    /// Create cluster-scoped metadata with standard labels
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            labels: standard_labels(&name),
            name,
            namespace: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// Standard labels for a resource named `name`
pub fn standard_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_MERIDIAN.to_string(),
        ),
    ])
}

/// A rendered Kubernetes object ready to be applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Target namespace (None for cluster-scoped resources)
    pub namespace: Option<String>,
    /// YAML document
    pub yaml: String,
}

impl Manifest {
    /// Render a typed resource
    pub fn render<T: Serialize>(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<&str>,
        resource: &T,
    ) -> Result<Self> {
        let kind = kind.into();
        let yaml = serde_yaml::to_string(resource)
            .map_err(|e| Error::serialization_for(kind.clone(), e.to_string()))?;
        Ok(Self {
            kind,
            name: name.into(),
            namespace: namespace.map(str::to_string),
            yaml,
        })
    }

    /// Render one of our own typed resources using its compile-time kind
    pub fn typed<T>(resource: &T, meta: &ObjectMeta) -> Result<Self>
    where
        T: Serialize + HasApiResource,
    {
        Self::render(T::KIND, &meta.name, meta.namespace.as_deref(), resource)
    }
}

/// Join manifests into a single multi-document YAML stream
pub fn render_stream(manifests: &[Manifest]) -> String {
    let mut out = String::new();
    for manifest in manifests {
        out.push_str("---\n");
        out.push_str(&manifest.yaml);
        if !manifest.yaml.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Validate a name that becomes a Kubernetes object name (RFC 1123 label)
pub fn validate_dns_label(component: &str, what: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(
            component,
            format!(
                "{} '{}' must be a DNS-1123 label (lowercase alphanumerics and '-', max 63 chars)",
                what, value
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Widget {
        #[serde(default = "Widget::default_api_version")]
        api_version: String,
        #[serde(default = "Widget::default_kind")]
        kind: String,
        metadata: ObjectMeta,
    }

    impl HasApiResource for Widget {
        const API_VERSION: &'static str = "example.io/v1";
        const KIND: &'static str = "Widget";
    }

    impl_api_defaults!(Widget);

    #[test]
    fn metadata_carries_standard_labels() {
        let meta = ObjectMeta::new("api", "platform");
        assert_eq!(meta.labels.get(LABEL_NAME), Some(&"api".to_string()));
        assert_eq!(
            meta.labels.get(LABEL_MANAGED_BY),
            Some(&LABEL_MANAGED_BY_MERIDIAN.to_string())
        );
        assert_eq!(meta.namespace.as_deref(), Some("platform"));

        let scoped = ObjectMeta::cluster_scoped("platform");
        assert!(scoped.namespace.is_none());
    }

    #[test]
    fn typed_render_uses_compile_time_kind() {
        let meta = ObjectMeta::new("w", "ns").with_annotation("a", "b");
        let widget = Widget {
            api_version: Widget::default_api_version(),
            kind: Widget::default_kind(),
            metadata: meta.clone(),
        };
        let manifest = Manifest::typed(&widget, &meta).expect("serializable");
        assert_eq!(manifest.kind, "Widget");
        assert_eq!(manifest.namespace.as_deref(), Some("ns"));
        assert!(manifest.yaml.contains("apiVersion: example.io/v1"));
        assert!(manifest.yaml.contains("kind: Widget"));
    }

    #[test]
    fn stream_separates_documents() {
        let a = Manifest::render("A", "a", None, &BTreeMap::from([("x", 1)])).expect("render");
        let b = Manifest::render("B", "b", None, &BTreeMap::from([("y", 2)])).expect("render");
        assert_eq!(render_stream(&[a, b]), "---\nx: 1\n---\ny: 2\n");
    }

    #[test]
    fn dns_labels() {
        assert!(validate_dns_label("vault", "name", "oauth-client-id").is_ok());
        assert!(validate_dns_label("vault", "name", "Bad_Name").is_err());
        assert!(validate_dns_label("vault", "name", "-leading").is_err());
        assert!(validate_dns_label("vault", "name", "").is_err());
        assert!(validate_dns_label("vault", "name", &"a".repeat(64)).is_err());
    }
}
