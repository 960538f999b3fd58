//! Error types for the Terrace provisioning engine.
//!
//! The hierarchy mirrors the lifecycle of a run: configuration errors are
//! fatal and raised before any provider call, provider errors are local to a
//! single action, state errors are fatal and never trigger a silent reset, and
//! execution errors describe how a run ended early.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Terrace engine.
#[derive(Debug, Error)]
pub enum TerraceError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration errors. All of them abort a run before any provider call.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two declarations share the same (type, name) identity.
    #[error("Duplicate resource declaration: {resource}")]
    DuplicateResource {
        /// The duplicated identity.
        resource: String,
    },

    /// One declaration lists the same attribute key twice.
    #[error("Attribute '{attribute}' declared more than once in {resource}")]
    DuplicateAttribute {
        /// Resource holding the duplicate key.
        resource: String,
        /// The duplicated attribute name.
        attribute: String,
    },

    /// A variable reference has no declaration, or neither a default nor an override.
    #[error("Undefined variable: {name}")]
    UndefinedVariable {
        /// Name of the variable.
        name: String,
    },

    /// A variable override does not match the declared type.
    #[error("Invalid value for variable '{name}': {message}")]
    InvalidVariableValue {
        /// Name of the variable.
        name: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A `${...}` expression could not be parsed.
    #[error("Invalid expression '{expression}': {message}")]
    InvalidExpression {
        /// The offending expression.
        expression: String,
        /// Description of the problem.
        message: String,
    },

    /// A reference targets a resource that is not declared.
    #[error("{source_resource} references undeclared resource {target}")]
    UnknownReference {
        /// Resource holding the reference.
        source_resource: String,
        /// The missing target.
        target: String,
    },

    /// A data source depends on a managed resource.
    #[error("Data source {resource} cannot depend on managed resource {target}")]
    InvalidDataSource {
        /// The data source.
        resource: String,
        /// The managed resource it references.
        target: String,
    },

    /// Missing environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Circular dependency detected.
    #[error("Cyclic dependency detected: {}", .resources.join(" -> "))]
    CyclicDependency {
        /// Resources participating in the cycle, in cycle order.
        resources: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is unreadable or inconsistent.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The run lock this process held was removed or replaced.
    #[error("State lock {lock_id} is no longer held: {message}")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
        /// What happened to it.
        message: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    LocalError {
        /// Description of the filesystem error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Provider errors. Each one is local to a single action.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// API request failed.
    #[error("Provider request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The remote object does not exist.
    #[error("Remote object not found: {provider_id}")]
    NotFound {
        /// Provider identifier that was not found.
        provider_id: String,
    },

    /// The provider could not be reached; the request was never delivered.
    #[error("Provider unreachable: {message}")]
    Unreachable {
        /// Description of the connection failure.
        message: String,
    },

    /// The exchange failed after the request was sent, so its outcome is unknown.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The provider does not support the requested operation.
    #[error("Unsupported operation for {resource_type}: {operation}")]
    Unsupported {
        /// Resource type.
        resource_type: String,
        /// Operation name.
        operation: String,
    },

    /// Image lookup returned no match.
    #[error("No image matches pattern '{pattern}'")]
    NoMatchingImage {
        /// The name pattern that was searched.
        pattern: String,
    },

    /// Operation rejected by the provider.
    #[error("Provider rejected {operation} of {resource}: {message}")]
    Rejected {
        /// Operation name.
        operation: String,
        /// Resource identity.
        resource: String,
        /// Provider message.
        message: String,
    },
}

/// Execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The run was cancelled by timeout or external signal.
    #[error("Run cancelled: {reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },

    /// A reference could not be resolved at execution time.
    #[error("Unresolved reference {reference} in {resource}")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference text.
        reference: String,
    },

    /// One or more actions did not complete successfully.
    #[error("{failed} action(s) failed, {skipped} skipped, {cancelled} cancelled")]
    Incomplete {
        /// Number of failed actions.
        failed: usize,
        /// Number of skipped actions.
        skipped: usize,
        /// Number of cancelled actions.
        cancelled: usize,
    },
}

/// Result type alias for Terrace operations.
pub type Result<T> = std::result::Result<T, TerraceError>;

impl TerraceError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::RateLimited { .. }
                    | ProviderError::Unreachable { .. }
                    | ProviderError::NetworkError { .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns true if the failed request may still have taken effect.
    ///
    /// Repeating a non-idempotent call after such an error can apply it twice.
    #[must_use]
    pub const fn outcome_unknown(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::NetworkError { .. }))
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provider(
                ProviderError::Unreachable { .. } | ProviderError::NetworkError { .. },
            ) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true for errors raised before any provider call was made.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
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

    /// Creates an expression error.
    #[must_use]
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates an error for a request that never reached the provider.
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}
