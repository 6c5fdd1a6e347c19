//! The single error enumeration shared by every Keel storage and
//! transaction surface.
//!
//! Backends and the coordinator all speak in terms of [`StoreError`]; the
//! terminal transaction variants (`PrepareFailed`, `PartiallyCommitted`)
//! are plain enum variants so callers can match on them instead of
//! downcasting an opaque error chain.

use thiserror::Error;

/// Boxed source error attached to failure-carrying variants.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Convenient result alias used across all Keel crates.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by Keel stores, resource adapters and sessions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation not permitted in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Key precondition violated at the API boundary.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Entity precondition violated at the API boundary.
    #[error("invalid entity '{key}': {reason}")]
    InvalidEntity {
        /// Key of the offending entity.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Serialized value exceeds the backend's configured maximum.
    #[error("value for key '{key}' is {size} bytes, limit is {limit} bytes")]
    ValueTooLarge {
        /// Key of the oversized value.
        key: String,
        /// Serialized size in bytes.
        size: usize,
        /// Configured maximum in bytes.
        limit: usize,
    },

    /// Backend cannot be reached (connection, permissions, timeout).
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Human-readable description of the failure.
        reason: String,
        /// Underlying cause, when one exists.
        #[source]
        source: Option<BoxedCause>,
    },

    /// Encode/decode failure.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Human-readable description of the failure.
        reason: String,
        /// Underlying cause, when one exists.
        #[source]
        source: Option<BoxedCause>,
    },

    /// At least one resource voted no during prepare; the session aborted.
    #[error("prepare failed: at least one resource voted no")]
    PrepareFailed,

    /// Commit-phase error after a successful prepare. Some resources
    /// committed, some did not; the application must reconcile.
    #[error("commit partially applied: {committed} of {total} resources committed")]
    PartiallyCommitted {
        /// Resources whose commit call succeeded.
        committed: usize,
        /// Total enrolled resources.
        total: usize,
    },

    /// A cancellation signal fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Savepoint name not present on the session's savepoint stack.
    #[error("unknown savepoint '{0}'")]
    UnknownSavepoint(String),

    /// Provider name not present in the factory registry or configuration.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

impl StoreError {
    /// Builds an [`StoreError::Unavailable`] without an underlying cause.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable { reason: reason.into(), source: None }
    }

    /// Builds an [`StoreError::Unavailable`] from an underlying error.
    pub fn unavailable_from<E>(reason: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Unavailable { reason: reason.into(), source: Some(Box::new(source)) }
    }

    /// Builds an [`StoreError::Serialization`] from an underlying error.
    pub fn serialization<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization { reason: source.to_string(), source: Some(Box::new(source)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_carries_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StoreError::unavailable_from("cannot open data file", io);
        assert!(err.to_string().contains("cannot open data file"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn partial_commit_message_names_counts() {
        let err = StoreError::PartiallyCommitted { committed: 1, total: 3 };
        assert_eq!(
            err.to_string(),
            "commit partially applied: 1 of 3 resources committed"
        );
    }
}
