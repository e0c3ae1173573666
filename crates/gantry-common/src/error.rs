//! Error types for the Gantry operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information such as the runner set
//! involved and whether the failure is worth retrying.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Gantry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {runner_set}: {message}")]
    Validation {
        /// Name of the runner set with invalid configuration
        runner_set: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.replicas")
        field: Option<String>,
    },

    /// Actions dispatch service error
    #[error("dispatch error for {runner_set}: {message}")]
    Dispatch {
        /// Name of the runner set the call was made for
        runner_set: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A referenced object does not exist yet
    ///
    /// Typically a credential secret that is created asynchronously.
    /// Always retryable; the reconcile is requeued with backoff.
    #[error("dependency missing [{resource}]: {message}")]
    DependencyMissing {
        /// Name of the missing object
        resource: String,
        /// Description of what was expected
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "teardown")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without runner-set context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            runner_set: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with runner-set context
    pub fn validation_for(runner_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            runner_set: runner_set.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with runner-set context and field path
    pub fn validation_for_field(
        runner_set: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            runner_set: runner_set.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable dispatch error
    pub fn dispatch(runner_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            runner_set: runner_set.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable dispatch error (e.g., auth failure)
    pub fn dispatch_permanent(runner_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dispatch {
            runner_set: runner_set.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a dependency-missing error for the named object
    pub fn dependency_missing(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DependencyMissing {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a spec
    /// change). Missing dependencies and internal errors are. Kubernetes and
    /// dispatch errors depend on the underlying failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (conflict, connection, timeout).
                // Don't retry on other 4xx errors (validation, forbidden, etc.)
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Dispatch { retryable, .. } => *retryable,
            Error::DependencyMissing { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the runner set name if this error is associated with one
    pub fn runner_set(&self) -> Option<&str> {
        match self {
            Error::Validation { runner_set, .. } => Some(runner_set),
            Error::Dispatch { runner_set, .. } => Some(runner_set),
            _ => None,
        }
    }
}
