//! Least-privilege permission sets and the identities that carry them
//!
//! A permission statement pairs actions with the resources they apply to.
//! Statements that mutate anything must name the resources, either by ARN or
//! by an ownership tag. Only read-only actions (`Describe*`, `List*`, `Get*`)
//! may apply to every resource.

use std::collections::BTreeSet;

use meridian_common::{Declaration, Error, NodeId, NodeKind, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Service account annotation that binds a cloud role to a pod identity
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Cloud role names are capped at 64 characters
const MAX_ROLE_NAME: usize = 64;

/// Which resources a statement applies to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceScope {
    /// Exactly these resources
    Arns(Vec<String>),
    /// Any resource carrying this tag
    Tagged {
        /// Tag key
        key: String,
        /// Required tag value
        value: String,
    },
    /// Every resource (read-only actions only)
    Unscoped,
}

/// Actions allowed on a scope
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PermissionStatement {
    /// Actions, e.g. `secretsmanager:GetSecretValue`
    pub actions: Vec<String>,
    /// Resources the actions apply to
    pub scope: ResourceScope,
}

impl PermissionStatement {
    fn to_document(&self) -> Value {
        let mut statement = json!({
            "Effect": "Allow",
            "Action": self.actions,
        });
        match &self.scope {
            ResourceScope::Arns(arns) => statement["Resource"] = json!(arns),
            ResourceScope::Tagged { key, value } => {
                statement["Resource"] = json!("*");
                statement["Condition"] = json!({
                    "StringEquals": { format!("aws:ResourceTag/{}", key): value }
                });
            }
            ResourceScope::Unscoped => statement["Resource"] = json!("*"),
        }
        statement
    }
}

/// Whether an action only reads
pub fn is_read_only(action: &str) -> bool {
    let verb = action.split_once(':').map_or(action, |(_, verb)| verb);
    ["Describe", "List", "Get"]
        .iter()
        .any(|prefix| verb.starts_with(prefix))
}

/// Set of statements granted to one identity
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSet {
    statements: Vec<PermissionStatement>,
}

impl PermissionSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `actions` on `scope`
    pub fn allow(mut self, actions: &[&str], scope: ResourceScope) -> Self {
        self.statements.push(PermissionStatement {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            scope,
        });
        self
    }

    /// Read access to exactly the given secret records plus decryption with their keys
    pub fn secret_reader(secret_arns: Vec<String>, key_arns: Vec<String>) -> Self {
        Self::new()
            .allow(
                &[
                    "secretsmanager:GetSecretValue",
                    "secretsmanager:DescribeSecret",
                ],
                ResourceScope::Arns(secret_arns),
            )
            .allow(&["kms:Decrypt"], ResourceScope::Arns(key_arns))
    }

    /// Statements in declaration order
    pub fn statements(&self) -> &[PermissionStatement] {
        &self.statements
    }

    /// Whether nothing is granted
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Every action granted, sorted
    pub fn actions(&self) -> BTreeSet<&str> {
        self.statements
            .iter()
            .flat_map(|s| s.actions.iter().map(String::as_str))
            .collect()
    }

    /// Check least privilege
    ///
    /// Rejects empty statements, empty ARN lists, malformed actions, and
    /// mutating actions on an unscoped resource.
    pub fn validate(&self, owner: &str) -> Result<()> {
        let fail = |msg: String| Error::configuration("cluster", format!("identity {}: {}", owner, msg));

        for statement in &self.statements {
            if statement.actions.is_empty() {
                return Err(fail("statement grants no actions".to_string()));
            }
            if let Some(bad) = statement.actions.iter().find(|a| !a.contains(':') || a.ends_with(':')) {
                return Err(fail(format!("action '{}' is not service:Action", bad)));
            }
            match &statement.scope {
                ResourceScope::Arns(arns) if arns.is_empty() => {
                    return Err(fail("statement names no resources".to_string()));
                }
                ResourceScope::Arns(arns) => {
                    if let Some(wild) = arns.iter().find(|arn| arn.as_str() == "*") {
                        return Err(fail(format!(
                            "resource '{}' must be scoped; use Unscoped for read-only actions",
                            wild
                        )));
                    }
                }
                ResourceScope::Tagged { key, .. } if key.is_empty() => {
                    return Err(fail("tag scope needs a key".to_string()));
                }
                ResourceScope::Tagged { .. } => {}
                ResourceScope::Unscoped => {
                    let mutating: Vec<&str> = statement
                        .actions
                        .iter()
                        .map(String::as_str)
                        .filter(|a| !is_read_only(a))
                        .collect();
                    if !mutating.is_empty() {
                        return Err(fail(format!(
                            "mutating actions {:?} must be scoped to specific resources",
                            mutating
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Render as a cloud policy document
    pub fn to_policy_document(&self) -> Value {
        json!({
            "Version": "2012-10-17",
            "Statement": self.statements.iter().map(PermissionStatement::to_document).collect::<Vec<_>>(),
        })
    }
}

/// IAM role name of the service account `namespace/name` in `cluster`
///
/// Names longer than the IAM limit keep a prefix and end in eight hex digits
/// of the SHA-256 of the full name.
pub fn role_name(cluster: &str, namespace: &str, name: &str) -> String {
    let full = format!("{}-{}-{}", cluster, namespace, name);
    if full.len() <= MAX_ROLE_NAME {
        return full;
    }
    let digest = Sha256::digest(full.as_bytes());
    let suffix = digest[..4]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    let mut prefix = full;
    prefix.truncate(MAX_ROLE_NAME - 9);
    format!("{}-{:08x}", prefix.trim_end_matches('-'), suffix)
}

/// ARN of a secret record (the store appends a random suffix)
pub fn secret_arn(region: &str, account_id: &str, storage_location: &str) -> String {
    format!(
        "arn:aws:secretsmanager:{}:{}:secret:{}-*",
        region, account_id, storage_location
    )
}

/// ARN of an encryption key; aliases are expanded, ARNs are kept as given
pub fn kms_key_arn(region: &str, account_id: &str, key_ref: &str) -> String {
    if key_ref.starts_with("arn:") {
        key_ref.to_string()
    } else {
        format!("arn:aws:kms:{}:{}:{}", region, account_id, key_ref)
    }
}

/// Cloud identity bound to one Kubernetes service account
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDeclaration {
    /// Service account name
    pub name: String,
    /// Service account namespace
    pub namespace: String,
    /// Cloud role name
    pub role_name: String,
    /// Cloud role ARN
    pub role_arn: String,
    /// What the identity may do
    pub permissions: PermissionSet,
    #[serde(skip)]
    after: Vec<NodeId>,
}

impl IdentityDeclaration {
    /// Declare an identity in `cluster` for the service account `namespace/name`
    ///
    /// The role name is derived deterministically so manifests can reference
    /// the ARN before the identity exists.
    pub fn new(
        cluster: &str,
        account_id: &str,
        namespace: impl Into<String>,
        name: impl Into<String>,
        permissions: PermissionSet,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        permissions.validate(&format!("{}/{}", namespace, name))?;

        let role_name = role_name(cluster, &namespace, &name);
        let role_arn = format!("arn:aws:iam::{}:role/{}", account_id, role_name);

        Ok(Self {
            after: vec![NodeId::cluster(cluster)],
            name,
            namespace,
            role_name,
            role_arn,
            permissions,
        })
    }

    /// Also wait for `node` before granting
    pub fn after(mut self, node: NodeId) -> Self {
        if !self.after.contains(&node) {
            self.after.push(node);
        }
        self
    }
}

impl Declaration for IdentityDeclaration {
    fn node_id(&self) -> NodeId {
        NodeId::namespaced(NodeKind::Identity, &self.namespace, &self.name)
    }

    fn dependencies(&self) -> Vec<NodeId> {
        self.after.clone()
    }
}
