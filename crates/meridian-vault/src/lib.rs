//! Secret vault declarations
//!
//! Declares one isolated secret record per sensitive value. The vault is a
//! leaf of the dependency graph: it depends on nothing, and downstream
//! components only ever see record identifiers.

#![deny(missing_docs)]

mod record;
mod vault;

pub use record::{
    GenerationPolicy, SecretExport, SecretRecord, MAX_RANDOM_LENGTH, MIN_RANDOM_LENGTH,
};
pub use vault::{SecretVault, SecretVaultBuilder};
