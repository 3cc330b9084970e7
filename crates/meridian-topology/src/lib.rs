//! Workload topology for Meridian
//!
//! Declares the namespace, the per-record secret bindings, the workload
//! units, the path-based routing table and the namespace network policy.
//! Workloads only ever reference synced Secrets by `(name, key)`; no storage
//! location reaches a pod spec.

#![deny(missing_docs)]

pub mod binding;
pub mod k8s;
pub mod network_policy;
pub mod routing;
mod topology;
pub mod workload;

pub use binding::{FieldMapping, FieldSource, SecretBinding, SecretProviderClass};
pub use network_policy::NetworkPolicyDeclaration;
pub use routing::{RouteValue, RoutingRule, RoutingTable};
pub use topology::{NamespaceDeclaration, WorkloadTopology};
pub use workload::{EnvBinding, WorkloadSpec, WorkloadState, WorkloadUnit};
