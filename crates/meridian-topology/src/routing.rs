//! Path-based routing through one load-balanced Ingress
//!
//! Every routed workload claims a path prefix. Prefixes are normalised to a
//! trailing `/` (`/engine/*` and `/engine` both become `/engine/`) and must be
//! disjoint: no prefix may be a prefix of another. The root prefix `/` is a
//! prefix of every path, so a workload claiming it must be the only routed
//! workload in the namespace.
//!
//! The host name and certificate reference are either written into the
//! configuration or read from a vault record when the Ingress is applied.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use meridian_common::manifest::{validate_dns_label, LABEL_PART_OF};
use meridian_common::{Declaration, Error, Manifest, NodeId, NodeKind, ObjectMeta, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::k8s::object_meta;

const COMPONENT: &str = "routing";

/// Ingress class served by the load-balancer controller
pub const INGRESS_CLASS: &str = "alb";

const ALB_PREFIX: &str = "alb.ingress.kubernetes.io";

/// Normalise a path prefix to its canonical `/segment/` form
///
/// A trailing `*` is dropped and a trailing `/` added. Wildcards anywhere
/// else, empty segments and prefixes not starting at `/` are rejected.
pub fn normalize_prefix(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_suffix('*').unwrap_or(trimmed);

    if !stripped.starts_with('/') {
        return Err(Error::configuration(
            COMPONENT,
            format!("path prefix '{}' must start with '/'", raw),
        ));
    }
    if stripped.contains('*') {
        return Err(Error::configuration(
            COMPONENT,
            format!("path prefix '{}' may only end with a wildcard", raw),
        ));
    }
    if stripped.contains("//") || stripped.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(Error::configuration(
            COMPONENT,
            format!("path prefix '{}' is not a plain path", raw),
        ));
    }

    if stripped.ends_with('/') {
        Ok(stripped.to_string())
    } else {
        Ok(format!("{}/", stripped))
    }
}

/// Whether two normalised prefixes claim a common path
pub fn prefixes_overlap(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Host name or certificate reference of the Ingress
///
/// In YAML either a plain string or `{fromSecret: <logical name>}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RouteValue {
    /// Value given directly
    Literal(String),
    /// Value of a vault record, resolved when the Ingress is applied
    FromSecret {
        /// Logical name of the record
        #[serde(rename = "fromSecret")]
        from_secret: String,
    },
}

impl RouteValue {
    /// Value read from the record `logical_name`
    pub fn from_secret(logical_name: impl Into<String>) -> Self {
        Self::FromSecret {
            from_secret: logical_name.into(),
        }
    }

    /// Logical name of the record this value comes from
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Literal(_) => None,
            Self::FromSecret { from_secret } => Some(from_secret),
        }
    }

    fn resolve(&self, values: &BTreeMap<String, String>, node: &NodeId) -> Result<Self> {
        match self {
            Self::Literal(_) => Ok(self.clone()),
            Self::FromSecret { from_secret } => values
                .get(from_secret)
                .map(|value| Self::Literal(value.clone()))
                .ok_or_else(|| {
                    Error::dependency_unsatisfied(
                        node.to_string(),
                        format!("value of {}", NodeId::secret(from_secret)),
                    )
                }),
        }
    }
}

impl From<&str> for RouteValue {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<String> for RouteValue {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

/// Literal values print as themselves, record references as `${secret:name}`
impl fmt::Display for RouteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.write_str(value),
            Self::FromSecret { from_secret } => write!(f, "${{secret:{}}}", from_secret),
        }
    }
}

/// One routed workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Normalised prefix, always ending in `/`
    pub path_prefix: String,
    /// Workload (and Service) name
    pub workload: String,
    /// Service port
    pub port: u16,
}

impl RoutingRule {
    /// Rule for `workload` on `port`, normalising `prefix`
    pub fn new(prefix: &str, workload: impl Into<String>, port: u16) -> Result<Self> {
        Ok(Self {
            path_prefix: normalize_prefix(prefix)?,
            workload: workload.into(),
            port,
        })
    }

    /// Path as written into the Ingress (`/engine`, or `/` for root)
    pub fn ingress_path(&self) -> &str {
        match self.path_prefix.trim_end_matches('/') {
            "" => "/",
            path => path,
        }
    }

    /// Whether `path` falls under this prefix
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix) || path == self.ingress_path()
    }
}

/// Ordered, disjoint routing rules behind one host
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    /// Namespace of the Ingress and the routed services
    pub namespace: String,
    /// Public host name
    pub host: RouteValue,
    /// TLS certificate served by the load balancer
    pub certificate_ref: RouteValue,
    /// Rules in declaration order
    pub rules: Vec<RoutingRule>,
    #[serde(skip)]
    requires: Vec<NodeId>,
}

impl RoutingTable {
    /// Build a table from rules in declaration order
    ///
    /// `requires` are the nodes the Ingress waits for besides the namespace
    /// and the records its values come from: the cluster, the load-balancer
    /// controllers and the routed workloads.
    pub(crate) fn new(
        namespace: &str,
        host: RouteValue,
        certificate_ref: RouteValue,
        routes: Vec<RoutingRule>,
        requires: Vec<NodeId>,
    ) -> Result<Self> {
        validate_values(&host, &certificate_ref)?;
        if routes.is_empty() {
            return Err(Error::configuration(
                COMPONENT,
                format!("no workload in namespace '{}' claims a path prefix", namespace),
            ));
        }

        let mut rules: Vec<RoutingRule> = Vec::new();
        for rule in routes {
            if let Some(clash) = rules
                .iter()
                .find(|r| prefixes_overlap(&r.path_prefix, &rule.path_prefix))
            {
                return Err(Error::configuration(
                    COMPONENT,
                    format!(
                        "prefix '{}' of '{}' overlaps prefix '{}' of '{}'",
                        rule.path_prefix, rule.workload, clash.path_prefix, clash.workload
                    ),
                ));
            }
            rules.push(rule);
        }

        Ok(Self {
            namespace: namespace.to_string(),
            host,
            certificate_ref,
            rules,
            requires,
        })
    }

    /// Name of the Ingress
    pub fn name(&self) -> &str {
        &self.namespace
    }

    /// Records the host or certificate are read from
    pub fn secret_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = [&self.host, &self.certificate_ref]
            .into_iter()
            .filter_map(RouteValue::secret)
            .collect();
        refs.dedup();
        refs
    }

    /// The table with record references replaced by their values
    ///
    /// `values` maps logical names to values; the resolved host must be a
    /// valid DNS name.
    pub fn resolved(&self, values: &BTreeMap<String, String>) -> Result<Self> {
        let node = self.node_id();
        let host = self.host.resolve(values, &node)?;
        let certificate_ref = self.certificate_ref.resolve(values, &node)?;
        validate_values(&host, &certificate_ref)?;
        Ok(Self {
            host,
            certificate_ref,
            ..self.clone()
        })
    }

    /// Rule that serves `path`
    pub fn match_path(&self, path: &str) -> Option<&RoutingRule> {
        self.rules.iter().find(|r| r.matches(path))
    }

    /// Ports the routed services listen on
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.rules.iter().map(|r| r.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        [
            ("scheme", "internet-facing"),
            ("target-type", "ip"),
            ("listen-ports", r#"[{"HTTP": 80}, {"HTTPS": 443}]"#),
            ("ssl-redirect", "443"),
        ]
        .into_iter()
        .map(|(key, value)| (format!("{}/{}", ALB_PREFIX, key), value.to_string()))
        .chain([(
            format!("{}/certificate-arn", ALB_PREFIX),
            self.certificate_ref.to_string(),
        )])
        .collect()
    }

    /// Build the Ingress
    pub fn ingress(&self) -> Ingress {
        let backend = |rule: &RoutingRule| IngressBackend {
            service: Some(IngressServiceBackend {
                name: rule.workload.clone(),
                port: Some(ServiceBackendPort {
                    number: Some(i32::from(rule.port)),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };

        let paths = self
            .rules
            .iter()
            .map(|rule| HTTPIngressPath {
                path: Some(rule.ingress_path().to_string()),
                path_type: "Prefix".to_string(),
                backend: backend(rule),
            })
            .collect();

        let mut meta = ObjectMeta::new(self.name(), &self.namespace)
            .with_label(LABEL_PART_OF, &self.namespace);
        meta.annotations = self.annotations();

        Ingress {
            metadata: object_meta(&meta),
            spec: Some(IngressSpec {
                ingress_class_name: Some(INGRESS_CLASS.to_string()),
                rules: Some(vec![IngressRule {
                    host: Some(self.host.to_string()),
                    http: Some(HTTPIngressRuleValue { paths }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Render the Ingress
    pub fn render(&self) -> Result<Manifest> {
        Manifest::render("Ingress", self.name(), Some(self.namespace.as_str()), &self.ingress())
    }
}

impl Declaration for RoutingTable {
    fn node_id(&self) -> NodeId {
        NodeId::new(NodeKind::Routing, &self.namespace)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        let mut deps = vec![NodeId::namespace(&self.namespace)];
        let secrets = self.secret_refs().into_iter().map(NodeId::secret);
        for node in self.requires.iter().cloned().chain(secrets) {
            if !deps.contains(&node) {
                deps.push(node);
            }
        }
        deps
    }
}

fn validate_values(host: &RouteValue, certificate_ref: &RouteValue) -> Result<()> {
    match host {
        RouteValue::Literal(host) => validate_host(host)?,
        RouteValue::FromSecret { from_secret } => {
            validate_dns_label(COMPONENT, "host record", from_secret)?
        }
    }
    match certificate_ref {
        RouteValue::Literal(cert) if cert.trim().is_empty() => Err(Error::configuration(
            COMPONENT,
            "certificate reference must not be empty",
        )),
        RouteValue::Literal(_) => Ok(()),
        RouteValue::FromSecret { from_secret } => {
            validate_dns_label(COMPONENT, "certificate record", from_secret)
        }
    }
}

fn validate_host(host: &str) -> Result<()> {
    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(
            COMPONENT,
            format!("host '{}' is not a lowercase DNS name", host),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(routes: &[(&str, &str)]) -> Result<RoutingTable> {
        let rules = routes
            .iter()
            .map(|(prefix, workload)| RoutingRule::new(prefix, *workload, 8080))
            .collect::<Result<Vec<_>>>()?;
        RoutingTable::new(
            "apps",
            "app.example.com".into(),
            "arn:aws:acm:us-east-1:123456789012:certificate/abc".into(),
            rules,
            vec![NodeId::cluster("prod")],
        )
    }

    #[test]
    fn prefixes_normalise_to_a_trailing_slash() {
        assert_eq!(normalize_prefix("/engine/*").expect("valid"), "/engine/");
        assert_eq!(normalize_prefix("/engine").expect("valid"), "/engine/");
        assert_eq!(normalize_prefix("/engine/").expect("valid"), "/engine/");
        assert_eq!(normalize_prefix("/*").expect("valid"), "/");
        assert_eq!(normalize_prefix("/").expect("valid"), "/");

        assert!(normalize_prefix("engine").is_err());
        assert!(normalize_prefix("/en*gine/").is_err());
        assert!(normalize_prefix("/engine//admin").is_err());
    }

    /// Story: two workloads may not claim overlapping prefixes
    #[test]
    fn story_nested_prefixes_are_rejected() {
        let err = table(&[("/engine/*", "engine"), ("/engine/admin/*", "admin")])
            .expect_err("nested prefix");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("/engine/admin/"));

        assert!(table(&[("/api/*", "api"), ("/api", "other")]).is_err());
        assert!(table(&[("/", "web"), ("/*", "other")]).is_err());
    }

    /// Story: the root prefix claims every path, so it cannot share the host
    #[test]
    fn story_root_prefix_overlaps_every_other_prefix() {
        for routes in [
            [("/", "web"), ("/api/*", "api")],
            [("/api/*", "api"), ("/*", "web")],
        ] {
            let err = table(&routes).expect_err("root overlaps /api/");
            assert!(err.is_configuration());
            assert!(err.to_string().contains("overlaps"));
        }

        let alone = table(&[("/", "web")]).expect("root alone is disjoint");
        assert_eq!(alone.match_path("/anything").map(|r| r.workload.as_str()), Some("web"));
        assert_eq!(alone.rules[0].ingress_path(), "/");
    }

    #[test]
    fn sibling_prefixes_do_not_overlap() {
        let table = table(&[("/engine/*", "engine"), ("/engineering/*", "docs")])
            .expect("disjoint after normalisation");
        assert_eq!(table.match_path("/engine/run").map(|r| r.workload.as_str()), Some("engine"));
        assert_eq!(
            table.match_path("/engineering/guide").map(|r| r.workload.as_str()),
            Some("docs")
        );
        assert_eq!(table.match_path("/engine").map(|r| r.workload.as_str()), Some("engine"));
        assert!(table.match_path("/elsewhere").is_none());
    }

    #[test]
    fn rejects_bad_host_and_empty_table() {
        let rules = vec![RoutingRule::new("/api", "api", 8080).expect("valid")];
        let build = |host: &str, cert: &str| {
            RoutingTable::new("apps", host.into(), cert.into(), rules.clone(), vec![])
        };
        assert!(build("App.Example.com", "cert").is_err());
        assert!(build("app.example.com", "").is_err());
        assert!(table(&[]).is_err());
    }

    #[test]
    fn ingress_carries_alb_annotations_and_ordered_paths() {
        let table = table(&[("/api/*", "api"), ("/auth/*", "auth"), ("/web/*", "web")]).expect("valid");
        let manifest = table.render().expect("renders");
        assert_eq!(manifest.kind, "Ingress");

        let yaml = &manifest.yaml;
        assert!(yaml.contains("ingressClassName: alb"));
        assert!(yaml.contains("alb.ingress.kubernetes.io/certificate-arn"));
        assert!(yaml.contains("alb.ingress.kubernetes.io/target-type: ip"));
        assert!(yaml.contains("host: app.example.com"));
        let api = yaml.find("path: /api").expect("api path");
        let auth = yaml.find("path: /auth").expect("auth path");
        assert!(api < auth);
        assert_eq!(manifest, table.render().expect("renders again"));
    }

    #[test]
    fn depends_on_namespace_and_requirements() {
        let table = table(&[("/api", "api")]).expect("valid");
        assert_eq!(table.node_id(), NodeId::new(NodeKind::Routing, "apps"));
        assert_eq!(
            table.dependencies(),
            vec![NodeId::namespace("apps"), NodeId::cluster("prod")]
        );
    }

    /// Story: host and certificate read from vault records at apply time
    #[test]
    fn story_values_from_records_resolve_before_rendering() {
        let rules = vec![RoutingRule::new("/api/*", "api", 8080).expect("valid")];
        let table = RoutingTable::new(
            "apps",
            RouteValue::from_secret("domain-name"),
            RouteValue::from_secret("certificate"),
            rules,
            vec![NodeId::cluster("prod")],
        )
        .expect("valid");

        assert_eq!(table.secret_refs(), vec!["domain-name", "certificate"]);
        let deps = table.dependencies();
        assert!(deps.contains(&NodeId::secret("domain-name")));
        assert!(deps.contains(&NodeId::secret("certificate")));
        assert!(table
            .render()
            .expect("renders")
            .yaml
            .contains("${secret:domain-name}"));

        let missing = table.resolved(&BTreeMap::new()).expect_err("values missing");
        assert!(matches!(missing, Error::DependencyUnsatisfied { .. }));

        let mut values = BTreeMap::from([
            ("domain-name".to_string(), "Not A Host".to_string()),
            (
                "certificate".to_string(),
                "arn:aws:acm:us-east-1:123456789012:certificate/abc".to_string(),
            ),
        ]);
        assert!(table.resolved(&values).expect_err("bad host").is_configuration());

        values.insert("domain-name".to_string(), "app.example.com".to_string());
        let resolved = table.resolved(&values).expect("resolves");
        assert!(resolved.secret_refs().is_empty());
        let yaml = resolved.render().expect("renders").yaml;
        assert!(yaml.contains("host: app.example.com"));
        assert!(yaml.contains("certificate/abc"));
    }

    #[test]
    fn route_values_parse_from_plain_strings_or_record_references() {
        let literal: RouteValue = serde_yaml::from_str("app.example.com").expect("parses");
        assert_eq!(literal, RouteValue::from("app.example.com"));
        let secret: RouteValue = serde_yaml::from_str("fromSecret: domain-name").expect("parses");
        assert_eq!(secret.secret(), Some("domain-name"));
        assert_eq!(secret.to_string(), "${secret:domain-name}");
    }

    proptest! {
        /// Distinct single-segment prefixes always build, and every path under
        /// a prefix reaches exactly that prefix's workload
        #[test]
        fn disjoint_prefixes_route_uniquely(
            segments in proptest::collection::btree_set("[a-z]{1,8}", 1..8),
            tail in "[a-z0-9/]{0,12}",
        ) {
            let routes: Vec<(String, String)> = segments
                .iter()
                .map(|s| (format!("/{}/*", s), s.clone()))
                .collect();
            let borrowed: Vec<(&str, &str)> =
                routes.iter().map(|(p, w)| (p.as_str(), w.as_str())).collect();
            let table = table(&borrowed).expect("disjoint");

            for segment in &segments {
                let path = format!("/{}/{}", segment, tail);
                let matching: Vec<&RoutingRule> =
                    table.rules.iter().filter(|r| r.matches(&path)).collect();
                prop_assert_eq!(matching.len(), 1);
                prop_assert_eq!(&matching[0].workload, segment);
            }
        }

        /// Nesting any prefix under another is always rejected
        #[test]
        fn nested_prefixes_never_build(
            parent in "[a-z]{1,8}",
            child in "[a-z]{1,8}",
        ) {
            let outer = format!("/{}/*", parent);
            let inner = format!("/{}/{}/*", parent, child);
            prop_assert!(table(&[(&outer, "outer"), (&inner, "inner")]).is_err());
            prop_assert!(table(&[(&inner, "inner"), (&outer, "outer")]).is_err());
        }
    }
}
