//! Error types for the Replicated Disk Operator
//!
//! Provides the error taxonomy shared by the reconcilers, the provisioner
//! capabilities and the resource stores, together with the requeue policy
//! derived from each error.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Taxonomy errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation already in progress for {kind}/{name}")]
    Aborted { kind: String, name: String },

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflicting write to {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Deadline exceeded after {after:?} during {operation}")]
    DeadlineExceeded { operation: String, after: Duration },

    // =========================================================================
    // Provisioner Errors
    // =========================================================================
    #[error("{operation} failed for {resource}: {source}")]
    Provisioner {
        operation: String,
        resource: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Wire-level error classification recorded on resource status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    Aborted,
    NotFound,
    AlreadyExists,
    Unavailable,
    Internal,
    DeadlineExceeded,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorCode::Aborted => write!(f, "Aborted"),
            ErrorCode::NotFound => write!(f, "NotFound"),
            ErrorCode::AlreadyExists => write!(f, "AlreadyExists"),
            ErrorCode::Unavailable => write!(f, "Unavailable"),
            ErrorCode::Internal => write!(f, "Internal"),
            ErrorCode::DeadlineExceeded => write!(f, "DeadlineExceeded"),
        }
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a missing resource
    pub fn not_found(kind: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Shorthand for a resource that is locked by another operation
    pub fn aborted(kind: &str, name: &str) -> Self {
        Error::Aborted {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Shorthand for a stale write
    pub fn conflict(kind: &str, name: &str) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Wrap a provisioner failure with the operation and resource it concerned
    pub fn provisioner(operation: &str, resource: &str, source: Error) -> Self {
        Error::Provisioner {
            operation: operation.to_string(),
            resource: resource.to_string(),
            source: Box::new(source),
        }
    }

    /// Innermost error, looking through provisioner context
    pub fn root(&self) -> &Error {
        match self {
            Error::Provisioner { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error into the status taxonomy
    pub fn code(&self) -> ErrorCode {
        match self.root() {
            Error::InvalidArgument(_) | Error::Configuration(_) => ErrorCode::InvalidArgument,
            Error::Aborted { .. } | Error::Conflict { .. } => ErrorCode::Aborted,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Error::Unavailable(_) | Error::Kube(_) => ErrorCode::Unavailable,
            Error::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            _ => ErrorCode::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.code() {
            // Another worker owns the resource; come back shortly
            ErrorCode::Aborted => ErrorAction::RequeueAfter(Duration::from_secs(1)),

            // Re-derive from current state right away
            ErrorCode::NotFound => ErrorAction::RequeueAfter(Duration::ZERO),

            // Bad input or idempotency signal - don't retry automatically
            ErrorCode::InvalidArgument | ErrorCode::AlreadyExists => ErrorAction::NoRequeue,

            // Transient provider failures
            ErrorCode::Unavailable | ErrorCode::Internal | ErrorCode::DeadlineExceeded => {
                ErrorAction::RequeueWithBackoff
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Unavailable | ErrorCode::Internal | ErrorCode::DeadlineExceeded
        )
    }

    /// The write was based on an outdated copy of the resource
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    /// Whether the remote side may have applied the operation anyway
    pub fn is_outcome_unknown(&self) -> bool {
        self.code() == ErrorCode::DeadlineExceeded
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::aborted("DiskVolume", "vol-1");
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(1))
        );

        let err = Error::InvalidArgument("capacity must be positive".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Unavailable("throttled".into());
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Internal("disk API returned 500".into());
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let invalid = Error::InvalidArgument("no capabilities".into());
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_transient());
    }

    #[test]
    fn test_conflict_is_aborted() {
        let err = Error::conflict("DiskVolumeAttachment", "att-1");
        assert!(err.is_conflict());
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_provisioner_context_keeps_code() {
        let err = Error::provisioner(
            "CreateVolume",
            "vol-1",
            Error::DeadlineExceeded {
                operation: "CreateVolume".into(),
                after: Duration::from_secs(5),
            },
        );
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
        assert!(err.is_outcome_unknown());
        assert!(err.to_string().contains("vol-1"));
    }
}
