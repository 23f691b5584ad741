//! Error types for the Skyforge provisioning engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration, graph validation, planning, provider calls, and state
//! management. Validation and planning errors always surface before any
//! provider call is made.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Skyforge engine.
#[derive(Debug, Error)]
pub enum SkyforgeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired-state graph validation errors.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Another run holds the state lock.
    #[error("Another run is in progress (lock holder: {holder}, since: {since})")]
    RunInProgress {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack document was not found.
    #[error("Stack document not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack document could not be parsed.
    #[error("Failed to parse stack document: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A configuration value is invalid.
    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// Field that failed validation.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors raised while building and validating the resource graph.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The resource references form a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle {
        /// Node ids along the cycle; the first id is repeated at the end.
        cycle: Vec<String>,
    },

    /// A property references a logical id that is not declared.
    #[error("Resource '{from}' property '{property}' references unknown resource '{target}'")]
    DanglingReference {
        /// Referencing resource.
        from: String,
        /// Property holding the reference.
        property: String,
        /// Missing logical id.
        target: String,
    },

    /// Two resources share a logical id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// The resource kind has no schema.
    #[error("Resource '{id}' has unknown kind '{kind}'")]
    UnknownKind {
        /// Resource id.
        id: String,
        /// Kind tag.
        kind: String,
    },

    /// A logical id is not well formed.
    #[error("Invalid resource id '{id}': {reason}")]
    InvalidId {
        /// The offending id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A reference expression could not be parsed.
    #[error("Resource '{from}' property '{property}' has malformed reference '{expression}'")]
    MalformedReference {
        /// Referencing resource.
        from: String,
        /// Property holding the reference.
        property: String,
        /// Raw expression.
        expression: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Ordering constraints cannot be satisfied.
    #[error("Unsatisfiable plan ordering among steps: {}", steps.join(", "))]
    Cycle {
        /// Descriptions of the steps left unordered.
        steps: Vec<String>,
    },

    /// A replaced resource's kind has no schema.
    #[error("No schema for kind '{kind}' of resource '{id}'")]
    MissingSchema {
        /// Logical id.
        id: String,
        /// Kind tag.
        kind: String,
    },

    /// The plan references a resource missing from both inputs.
    #[error("Resource '{id}' is neither desired nor recorded in state")]
    UnknownResource {
        /// Logical id.
        id: String,
    },
}

/// Errors reported by a provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Transient failure (rate limit, timeout, unavailable).
    #[error("Retryable provider failure: {message}")]
    Retryable {
        /// Provider detail.
        message: String,
        /// Suggested wait before retrying.
        retry_after_secs: Option<u64>,
    },

    /// Permanent failure.
    #[error("Provider failure: {message}")]
    Fatal {
        /// Provider detail.
        message: String,
    },

    /// The physical resource does not exist.
    #[error("Resource not found: {physical_id}")]
    NotFound {
        /// Physical id that was not found.
        physical_id: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
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

    /// Persisting state failed.
    #[error("Failed to persist state: {message}")]
    WriteFailed {
        /// Description of the write failure.
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

/// Result type alias for Skyforge operations.
pub type Result<T> = std::result::Result<T, SkyforgeError>;

impl SkyforgeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors raised before any side effect because the
    /// desired state itself is invalid or cannot be ordered.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Plan(_) | Self::Config(_))
    }
}

impl ConfigError {
    /// Creates an invalid-value error for a specific field.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

impl StateError {
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

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = ValidationError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_validation_classification() {
        let err = SkyforgeError::from(ValidationError::DuplicateId { id: "x".into() });
        assert!(err.is_validation());

        let err = SkyforgeError::RunInProgress {
            holder: "h".into(),
            since: "now".into(),
        };
        assert!(!err.is_validation());
    }

    #[test]
    fn test_provider_retryable() {
        assert!(ProviderError::retryable("slow down").is_retryable());
        assert!(!ProviderError::fatal("bad request").is_retryable());
    }
}
