//! Common types for Meridian: errors, the resource dependency graph and
//! manifest rendering helpers shared by the vault, cluster and topology crates.

#![deny(missing_docs)]

pub mod error;
pub mod graph;
pub mod manifest;

pub use error::Error;
pub use graph::{Declaration, DependencyGraph, NodeId, NodeKind, Sequence};
pub use manifest::{HasApiResource, Manifest, ObjectMeta};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
