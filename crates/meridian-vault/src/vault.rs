//! SecretVault: one isolated record per sensitive value
//!
//! The vault is declared through a builder. A declaration error aborts the
//! whole vault, so either every record is valid and unique or no vault
//! exists at all.

use std::collections::BTreeSet;

use meridian_common::manifest::validate_dns_label;
use meridian_common::{Error, Result};
use tracing::debug;

use crate::record::{GenerationPolicy, SecretExport, SecretRecord};

const COMPONENT: &str = "vault";

/// Required number of fields in the single permitted multi-field record
const CREDENTIAL_FIELD_COUNT: usize = 2;

/// Builder collecting record declarations
///
/// A rejected declaration poisons the builder: `build` fails with the first
/// rejection even if the caller ignored it.
#[derive(Debug)]
pub struct SecretVaultBuilder {
    prefix: String,
    encryption_key_ref: String,
    records: Vec<SecretRecord>,
    first_rejection: Option<String>,
}

impl SecretVaultBuilder {
    /// Declare one secret record
    ///
    /// Fails on an invalid or duplicate logical name, a duplicate storage
    /// location, invalid policy parameters, or a second multi-field record.
    pub fn declare_secret(
        &mut self,
        logical_name: impl Into<String>,
        policy: GenerationPolicy,
    ) -> Result<SecretRecord> {
        let result = self.declare(logical_name.into(), policy);
        if let Err(err) = &result {
            self.first_rejection.get_or_insert_with(|| err.to_string());
        }
        result
    }

    fn declare(&mut self, logical_name: String, policy: GenerationPolicy) -> Result<SecretRecord> {
        validate_dns_label(COMPONENT, "logical name", &logical_name)?;

        if self.records.iter().any(|r| r.logical_name() == logical_name) {
            return Err(Error::configuration(
                COMPONENT,
                format!("secret '{}' declared twice", logical_name),
            ));
        }

        let storage_location = format!("{}/{}", self.prefix, logical_name);
        if self
            .records
            .iter()
            .any(|r| r.storage_location() == storage_location)
        {
            return Err(Error::configuration(
                COMPONENT,
                format!("storage location '{}' already in use", storage_location),
            ));
        }

        policy.validate().map_err(|msg| {
            Error::configuration(COMPONENT, format!("secret '{}': {}", logical_name, msg))
        })?;

        let fields = policy.fields();
        if !fields.is_empty() {
            if fields.len() != CREDENTIAL_FIELD_COUNT {
                return Err(Error::configuration(
                    COMPONENT,
                    format!(
                        "secret '{}' combines {} values; only a {}-field credential pair may share a record",
                        logical_name,
                        fields.len(),
                        CREDENTIAL_FIELD_COUNT
                    ),
                ));
            }
            if let Some(existing) = self.records.iter().find(|r| r.is_multi_field()) {
                return Err(Error::configuration(
                    COMPONENT,
                    format!(
                        "secret '{}' is a second multi-field record; '{}' is already the credential pair",
                        logical_name,
                        existing.logical_name()
                    ),
                ));
            }
        }

        let record = SecretRecord::new(
            logical_name,
            storage_location,
            self.encryption_key_ref.clone(),
            policy,
        );
        debug!(
            secret = record.logical_name(),
            location = record.storage_location(),
            "Declared secret record"
        );
        self.records.push(record.clone());
        Ok(record)
    }

    /// Finish the vault
    pub fn build(self) -> Result<SecretVault> {
        if let Some(rejection) = self.first_rejection {
            return Err(Error::configuration(
                COMPONENT,
                format!("vault has a rejected declaration: {}", rejection),
            ));
        }
        if self.prefix.is_empty() {
            return Err(Error::configuration(COMPONENT, "storage prefix must not be empty"));
        }
        if self.prefix.ends_with('/') || self.prefix.starts_with('/') {
            return Err(Error::configuration(
                COMPONENT,
                format!("storage prefix '{}' must not start or end with '/'", self.prefix),
            ));
        }
        if self.encryption_key_ref.is_empty() {
            return Err(Error::configuration(
                COMPONENT,
                "encryption key reference must not be empty",
            ));
        }

        Ok(SecretVault {
            prefix: self.prefix,
            encryption_key_ref: self.encryption_key_ref,
            records: self.records,
        })
    }
}

/// The set of isolated secret records
#[derive(Clone, Debug)]
pub struct SecretVault {
    prefix: String,
    encryption_key_ref: String,
    records: Vec<SecretRecord>,
}

impl SecretVault {
    /// Start declaring records under `prefix`, encrypted with `encryption_key_ref`
    pub fn builder(
        prefix: impl Into<String>,
        encryption_key_ref: impl Into<String>,
    ) -> SecretVaultBuilder {
        SecretVaultBuilder {
            prefix: prefix.into(),
            encryption_key_ref: encryption_key_ref.into(),
            records: Vec::new(),
            first_rejection: None,
        }
    }

    /// Storage prefix shared by every record
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key used to encrypt every record
    pub fn encryption_key_ref(&self) -> &str {
        &self.encryption_key_ref
    }

    /// Records in declaration order
    pub fn records(&self) -> &[SecretRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the vault has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by logical name
    pub fn get(&self, logical_name: &str) -> Option<&SecretRecord> {
        self.records.iter().find(|r| r.logical_name() == logical_name)
    }

    /// Look up a record that must exist
    pub fn require(&self, logical_name: &str) -> Result<&SecretRecord> {
        self.get(logical_name).ok_or_else(|| {
            Error::configuration(
                COMPONENT,
                format!("secret '{}' is not declared in the vault", logical_name),
            )
        })
    }

    /// The multi-field credential record, if one was declared
    pub fn credential(&self) -> Option<&SecretRecord> {
        self.records.iter().find(|r| r.is_multi_field())
    }

    /// Identifiers of every record, for the components downstream
    pub fn exports(&self) -> Vec<SecretExport> {
        self.records.iter().map(SecretRecord::export).collect()
    }

    /// Distinct storage locations (one per record)
    pub fn storage_locations(&self) -> BTreeSet<&str> {
        self.records.iter().map(SecretRecord::storage_location).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::Declaration;
    use proptest::prelude::*;

    /// The five single values and the database credential of the reference platform
    fn reference_vault() -> SecretVault {
        let mut builder = SecretVault::builder("meridian/prod", "alias/meridian-secrets");
        builder
            .declare_secret("domain-name", GenerationPolicy::external())
            .expect("valid");
        builder
            .declare_secret("certificate-arn", GenerationPolicy::external())
            .expect("valid");
        builder
            .declare_secret("oauth-client-id", GenerationPolicy::external())
            .expect("valid");
        builder
            .declare_secret(
                "oauth-client-secret",
                GenerationPolicy::External {
                    rotation_days: Some(90),
                },
            )
            .expect("valid");
        builder
            .declare_secret("admin-password", GenerationPolicy::random(32))
            .expect("valid");
        builder
            .declare_secret("docdb-credential", GenerationPolicy::credential("docdbadmin"))
            .expect("valid");
        builder.build().expect("vault builds")
    }

    // ==========================================================================
    // Story Tests: Declaring Isolated Secrets
    // ==========================================================================

    /// Story: five values plus the database credential become six records
    ///
    /// Each value gets its own storage location; the credential pair is the
    /// only record with named fields.
    #[test]
    fn story_each_value_gets_its_own_record() {
        let vault = reference_vault();

        assert_eq!(vault.len(), 6);
        assert_eq!(vault.storage_locations().len(), 6);
        assert_eq!(
            vault
                .require("oauth-client-secret")
                .expect("declared")
                .storage_location(),
            "meridian/prod/oauth-client-secret"
        );

        let multi: Vec<&str> = vault
            .records()
            .iter()
            .filter(|r| r.is_multi_field())
            .map(SecretRecord::logical_name)
            .collect();
        assert_eq!(multi, vec!["docdb-credential"]);
        assert_eq!(
            vault.credential().map(SecretRecord::fields),
            Some(vec!["username".to_string(), "password".to_string()])
        );
    }

    /// Story: a duplicate declaration fails the whole vault
    #[test]
    fn story_duplicates_fail_the_vault() {
        let mut builder = SecretVault::builder("meridian/prod", "alias/k");
        builder
            .declare_secret("admin-password", GenerationPolicy::random(32))
            .expect("first declaration");
        let err = builder
            .declare_secret("admin-password", GenerationPolicy::random(16))
            .expect_err("duplicate");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("declared twice"));

        let err = builder.build().expect_err("rejection is remembered");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn ignored_rejection_still_fails_the_build() {
        let mut builder = SecretVault::builder("meridian/prod", "alias/k");
        let _ = builder.declare_secret("Not_A_Label", GenerationPolicy::external());
        builder
            .declare_secret("admin-password", GenerationPolicy::random(32))
            .expect("later declarations are still checked");
        let _ = builder.declare_secret("admin-password", GenerationPolicy::random(16));

        let err = builder.build().expect_err("first rejection is kept");
        assert!(err.to_string().contains("Not_A_Label"));
    }

    /// Story: values are never combined into one record beyond the credential pair
    #[test]
    fn story_combined_values_are_rejected() {
        let mut builder = SecretVault::builder("meridian/prod", "alias/k");
        builder
            .declare_secret("docdb-credential", GenerationPolicy::credential("admin"))
            .expect("the sanctioned pair");

        let err = builder
            .declare_secret("other-credential", GenerationPolicy::credential("other"))
            .expect_err("second pair");
        assert!(err.to_string().contains("second multi-field record"));

        let triple = GenerationPolicy::JsonTemplate {
            template: [("client-id", "x"), ("domain", "y")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            generate_key: "client-secret".to_string(),
        };
        let mut builder = SecretVault::builder("meridian/prod", "alias/k");
        let err = builder
            .declare_secret("bundle", triple)
            .expect_err("three values in one record");
        assert!(err.to_string().contains("combines 3 values"));
    }

    #[test]
    fn invalid_names_and_prefixes_are_rejected() {
        let mut builder = SecretVault::builder("meridian/prod", "alias/k");
        assert!(builder
            .declare_secret("Admin_Password", GenerationPolicy::random(32))
            .is_err());

        assert!(SecretVault::builder("", "alias/k").build().is_err());
        assert!(SecretVault::builder("meridian/", "alias/k").build().is_err());
        assert!(SecretVault::builder("meridian", "").build().is_err());
    }

    #[test]
    fn records_are_leaf_nodes() {
        let vault = reference_vault();
        for record in vault.records() {
            assert!(record.dependencies().is_empty());
            assert_eq!(record.node_id().to_string(), format!("secret/{}", record.logical_name()));
        }
    }

    #[test]
    fn exports_carry_identifiers_only() {
        let vault = reference_vault();
        let exports = vault.exports();
        assert_eq!(exports.len(), 6);
        assert_eq!(exports[0].logical_name, "domain-name");
        assert_eq!(exports[0].storage_location, "meridian/prod/domain-name");
    }

    #[test]
    fn missing_record_lookup_is_a_configuration_error() {
        let vault = reference_vault();
        assert!(vault.require("ghost").expect_err("undeclared").is_configuration());
    }

    proptest! {
        /// Any set of distinct valid names builds, one location per name
        #[test]
        fn distinct_names_get_distinct_locations(
            names in prop::collection::btree_set("[a-z][a-z0-9-]{0,20}[a-z0-9]", 1..12)
        ) {
            let mut builder = SecretVault::builder("p", "alias/k");
            for name in &names {
                builder.declare_secret(name.clone(), GenerationPolicy::random(16)).expect("valid name");
            }
            let vault = builder.build().expect("vault builds");
            prop_assert_eq!(vault.len(), names.len());
            prop_assert_eq!(vault.storage_locations().len(), names.len());
        }
    }
}
