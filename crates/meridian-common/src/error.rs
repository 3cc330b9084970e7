//! Error types for platform provisioning
//!
//! Errors carry the identity of the component or graph node that produced
//! them. Nothing here is retried: retry and backoff belong to the backends
//! that actually talk to cloud APIs.

use thiserror::Error;

/// Main error type for Meridian operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid declaration detected while building the graph
    #[error("configuration error in {component}: {message}")]
    Configuration {
        /// Component that rejected the declaration (vault, cluster, topology, ...)
        component: String,
        /// Description of what's invalid
        message: String,
    },

    /// A node depends on something that does not exist or has not produced output
    #[error("dependency unsatisfied: {node} requires {missing}{}", format_chain(.chain))]
    DependencyUnsatisfied {
        /// Node whose dependency is missing
        node: String,
        /// The missing dependency
        missing: String,
        /// Declared dependency chain leading to `node`, root first
        chain: Vec<String>,
    },

    /// A backend call failed; the message is surfaced verbatim
    #[error("backend unavailable [{backend}] while evaluating {node}: {message}")]
    BackendUnavailable {
        /// Backend that failed (secret-store, cluster-api, database-api)
        backend: String,
        /// Node being evaluated
        node: String,
        /// Backend's own error message
        message: String,
    },

    /// The declared edges contain a cycle
    #[error("dependency cycle detected among: {}", .nodes.join(", "))]
    Cycle {
        /// Nodes that could not be placed
        nodes: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Evaluation of a graph node failed
    #[error("evaluation of {node} failed{}: {source}", format_chain(.chain))]
    Evaluation {
        /// Node that failed
        node: String,
        /// Declared dependency chain leading to `node`, root first
        chain: Vec<String>,
        /// Underlying failure
        source: Box<Error>,
    },
}

fn format_chain(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (chain: {})", chain.join(" -> "))
    }
}

impl Error {
    /// Create a configuration error for a component
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a dependency error without chain context
    pub fn dependency_unsatisfied(node: impl Into<String>, missing: impl Into<String>) -> Self {
        Self::DependencyUnsatisfied {
            node: node.into(),
            missing: missing.into(),
            chain: Vec::new(),
        }
    }

    /// Create a backend error for the node being evaluated
    pub fn backend(
        backend: impl Into<String>,
        node: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap a node failure with the node's identity and dependency chain
    pub fn evaluation(node: impl Into<String>, chain: Vec<String>, source: Error) -> Self {
        Self::Evaluation {
            node: node.into(),
            chain,
            source: Box::new(source),
        }
    }

    /// Check if this error is retryable
    ///
    /// Always false. Configuration and graph errors need a fix to the
    /// declarations, and backend errors have already exhausted whatever
    /// retry policy the backend applies.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Configuration { .. }
            | Error::DependencyUnsatisfied { .. }
            | Error::BackendUnavailable { .. }
            | Error::Cycle { .. }
            | Error::Serialization { .. }
            | Error::Evaluation { .. } => false,
        }
    }

    /// Whether this error (or the failure it wraps) is a configuration error
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Configuration { .. } => true,
            Error::Evaluation { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// Get the graph node this error is attributed to, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::DependencyUnsatisfied { node, .. } => Some(node),
            Error::BackendUnavailable { node, .. } => Some(node),
            Error::Evaluation { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
