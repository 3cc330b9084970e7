//! Meridian - dependency-ordered provisioning of a secret-isolated platform
//!
//! A platform is declared in three stages that only ever flow one way:
//!
//! - the secret vault declares every sensitive value and exports
//!   identifiers, never values
//! - the cluster provisioner declares the cluster, its capacity, the
//!   supporting controllers and the database
//! - the workload topology binds secrets into one namespace, declares the
//!   workloads and routes traffic to them
//!
//! # Modules
//!
//! - [`config`] - Platform configuration file
//! - [`platform`] - Assembly of the declarations into one dependency graph
//! - [`scheduler`] - Group-by-group evaluation of the graph
//! - [`backend`] - Interfaces to the secret store, cluster and database

#![deny(missing_docs)]

pub mod backend;
pub mod config;
pub mod platform;
pub mod scheduler;

pub use backend::{Backends, ClusterApi, DatabaseApi, RecordingBackend, SecretStore};
pub use config::PlatformConfig;
pub use meridian_common::{Error, Result};
pub use platform::{Platform, Resource};
pub use scheduler::{EvaluationReport, FailurePolicy, NodeOutcome, Scheduler};
