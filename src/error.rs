//! Error types for the deployment orchestrator.
//!
//! This module provides the error hierarchy for every stage of a deployment
//! run: loading the descriptor, talking to the cloud control plane, planning,
//! applying, converging and recording state.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the deployment orchestrator.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Descriptor loading or validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cloud control-plane errors.
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Plan execution errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Convergence errors.
    #[error("Convergence error: {0}")]
    Convergence(#[from] ConvergenceError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Descriptor loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The descriptor file was not found.
    #[error("Deployment spec not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The descriptor could not be parsed.
    #[error("Failed to parse deployment spec: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location (`line:column`).
        location: Option<String>,
    },

    /// A field is missing or malformed.
    #[error("Invalid deployment spec: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Dotted path of the offending field.
        field: Option<String>,
    },

    /// An environment variable referenced by the descriptor is not set.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors reported by the cloud control plane.
///
/// Variants are split into transient failures, which the apply engine
/// retries with backoff, and permanent ones, which abort the chain.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// The API throttled the request.
    #[error("{operation}: request throttled: {message}")]
    Throttled {
        /// API operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// The request never reached the API or timed out.
    #[error("{operation}: network error: {message}")]
    Network {
        /// API operation that failed.
        operation: String,
        /// Transport error description.
        message: String,
    },

    /// The API reported a server-side failure.
    #[error("{operation}: service unavailable: {message}")]
    Unavailable {
        /// API operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// A resource that was just created is not visible yet.
    #[error("{operation}: resource not yet visible: {message}")]
    NotYetVisible {
        /// API operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// The caller lacks permission.
    #[error("{operation}: access denied: {message}")]
    AccessDenied {
        /// API operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// The request parameters were rejected.
    #[error("{operation}: invalid parameter: {message}")]
    InvalidParameter {
        /// API operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// The referenced resource does not exist.
    #[error("{operation}: not found: {message}")]
    NotFound {
        /// API operation that failed.
        operation: String,
        /// Provider message.
        message: String,
    },

    /// Any other API error.
    #[error("{operation}: {code}: {message}")]
    Api {
        /// API operation that failed.
        operation: String,
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },

    /// A transient error persisted past the retry budget.
    #[error("{operation}: giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation that was retried.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last transient error seen.
        last_error: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The recorded state could not be read or parsed.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The run lock could not be written.
    #[error("Failed to acquire run lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Another run holds the lock for this cluster.
    #[error("Cluster {cluster} is locked by another run (holder: {holder}, since: {since})")]
    LockedByOther {
        /// Cluster the lock is keyed by.
        cluster: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Backend storage error (filesystem or S3).
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization failure.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// The state file was written by an incompatible version.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version.
        expected: String,
        /// Found version.
        found: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A field changed that the provider cannot update in place.
    #[error("{resource}: `{field}` cannot be changed in place ({observed} -> {desired}); tear down and redeploy")]
    ImmutableChange {
        /// Resource whose field changed.
        resource: String,
        /// Name of the immutable field.
        field: String,
        /// Observed value.
        observed: String,
        /// Desired value.
        desired: String,
    },

    /// `update` was requested but the service has never been deployed.
    #[error("Service {service} does not exist in cluster {cluster}; run `deploy` first")]
    NotDeployed {
        /// Cluster name.
        cluster: String,
        /// Service name.
        service: String,
    },

    /// An operation depends on one that is not earlier in the plan.
    #[error("Operation {index} depends on {dependency}, which does not precede it")]
    InvalidDependency {
        /// Index of the dependent operation.
        index: usize,
        /// Index of the dependency.
        dependency: usize,
    },
}

/// Plan execution errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An operation failed permanently; the run stopped.
    #[error("{operation} failed: {source} ({completed} completed, {skipped} skipped)")]
    OperationFailed {
        /// Description of the first failing operation.
        operation: String,
        /// The cloud error that stopped it.
        source: CloudError,
        /// Number of operations that completed.
        completed: usize,
        /// Number of operations that were skipped.
        skipped: usize,
    },

    /// A binding required by an operation was never produced.
    #[error("{operation}: missing {binding}")]
    MissingBinding {
        /// Description of the operation.
        operation: String,
        /// Name of the missing binding.
        binding: &'static str,
    },
}

/// Convergence errors.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// The service did not stabilise before the deadline.
    #[error(
        "{cluster}/{service} did not converge within {timeout_secs}s (desired {desired}, running {running}, pending {pending}, healthy {healthy})"
    )]
    Timeout {
        /// Cluster name.
        cluster: String,
        /// Service name.
        service: String,
        /// Deadline in seconds.
        timeout_secs: u64,
        /// Desired task count.
        desired: u32,
        /// Running task count.
        running: u32,
        /// Pending task count.
        pending: u32,
        /// Healthy task count.
        healthy: u32,
    },

    /// The service is flapping or its rollout failed.
    #[error("{cluster}/{service} is degraded: {reason}")]
    Degraded {
        /// Cluster name.
        cluster: String,
        /// Service name.
        service: String,
        /// Why the service was judged degraded.
        reason: String,
    },
}

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the operation that produced this error may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Cloud(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the cloud error, if this is one.
    #[must_use]
    pub const fn as_cloud(&self) -> Option<&CloudError> {
        match self {
            Self::Cloud(e) => Some(e),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Returns the offending field, if known.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::ValidationError { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

impl CloudError {
    /// Returns true for throttling, network, server-side and
    /// read-after-write failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. }
                | Self::Network { .. }
                | Self::Unavailable { .. }
                | Self::NotYetVisible { .. }
        )
    }

    /// Returns true if the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Reinterprets a not-found error as a read-after-write gap.
    ///
    /// Used for calls that reference a resource created earlier in the run.
    #[must_use]
    pub fn read_after_write(self) -> Self {
        match self {
            Self::NotFound { operation, message } => Self::NotYetVisible { operation, message },
            other => other,
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a throttling error.
    #[must_use]
    pub fn throttled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Throttled {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an access-denied error.
    #[must_use]
    pub fn access_denied(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessDenied {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
