//! Cluster provisioning declarations
//!
//! Declares the managed cluster with its partitioned network and tagged
//! worker capacity, the chart-installed controllers with least-privilege
//! identities, and the managed document database.

#![deny(missing_docs)]

pub mod capacity;
pub mod cluster;
pub mod controllers;
pub mod database;
pub mod network;
pub mod permissions;
mod provisioner;

pub use capacity::CapacityPolicy;
pub use cluster::{ClusterDeclaration, ClusterHandle};
pub use controllers::{ChartRef, ControllerDeclaration, ControllerRefs, ControllerRole, ControllerSpec};
pub use database::{
    CredentialPolicy, DatabaseDeclaration, DatabaseEndpoint, DatabaseHandle, DatabaseNetworkRule,
    DatabaseSpec,
};
pub use network::{NetworkLayout, NetworkSpec};
pub use permissions::{IdentityDeclaration, PermissionSet, PermissionStatement, ResourceScope};
pub use provisioner::ClusterProvisioner;
