//! Error types for the database client core.
//!
//! This module defines the caller-facing error taxonomy using `thiserror`.
//! Every error carries a [`ErrorKind`] so callers can branch on the category
//! instead of on messages or raw backend codes.

use crate::classify::{BackendError, BackendErrorKind};
use thiserror::Error;

/// Closed set of caller-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PoolExhausted,
    ConnectionTimeout,
    PoolClosed,
    DoubleRelease,
    ConcurrentUse,
    Query,
    TransactionAborted,
    InvalidState,
    InvalidIdentifier,
    UnsupportedOperator,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::ConnectionTimeout => "connection_timeout",
            Self::PoolClosed => "pool_closed",
            Self::DoubleRelease => "double_release",
            Self::ConcurrentUse => "concurrent_use",
            Self::Query => "query",
            Self::TransactionAborted => "transaction_aborted",
            Self::InvalidState => "invalid_state",
            Self::InvalidIdentifier => "invalid_identifier",
            Self::UnsupportedOperator => "unsupported_operator",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Pool exhausted: all {max_connections} connections are leased")]
    PoolExhausted { max_connections: usize },

    #[error("Timed out after {waited_ms}ms waiting for a connection")]
    ConnectionTimeout { waited_ms: u64 },

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Lease {lease_id} was already released")]
    DoubleRelease { lease_id: u64 },

    #[error("Lease {lease_id} already has a statement in flight")]
    ConcurrentUse { lease_id: u64 },

    /// Backend failure; the classified cause is the error source.
    #[error("Query failed: {source}")]
    Query {
        #[source]
        source: BackendError,
    },

    #[error("Transaction aborted: {message}")]
    TransactionAborted { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Invalid identifier: '{identifier}'")]
    InvalidIdentifier { identifier: String },

    #[error("Unsupported operator: '{operator}'")]
    UnsupportedOperator { operator: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl DbError {
    /// Create a pool exhausted error.
    pub fn pool_exhausted(max_connections: usize) -> Self {
        Self::PoolExhausted { max_connections }
    }

    /// Create a connection timeout error.
    pub fn connection_timeout(waited: std::time::Duration) -> Self {
        Self::ConnectionTimeout {
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a double release error.
    pub fn double_release(lease_id: u64) -> Self {
        Self::DoubleRelease { lease_id }
    }

    /// Create a concurrent use error.
    pub fn concurrent_use(lease_id: u64) -> Self {
        Self::ConcurrentUse { lease_id }
    }

    /// Wrap a classified backend error.
    pub fn query(source: BackendError) -> Self {
        Self::Query { source }
    }

    /// Create a transaction aborted error.
    pub fn transaction_aborted(message: impl Into<String>) -> Self {
        Self::TransactionAborted {
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an invalid identifier error.
    pub fn invalid_identifier(identifier: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            identifier: identifier.into(),
        }
    }

    /// Create an unsupported operator error.
    pub fn unsupported_operator(operator: impl Into<String>) -> Self {
        Self::UnsupportedOperator {
            operator: operator.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Get the caller-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::DoubleRelease { .. } => ErrorKind::DoubleRelease,
            Self::ConcurrentUse { .. } => ErrorKind::ConcurrentUse,
            Self::Query { .. } => ErrorKind::Query,
            Self::TransactionAborted { .. } => ErrorKind::TransactionAborted,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidIdentifier { .. } => ErrorKind::InvalidIdentifier,
            Self::UnsupportedOperator { .. } => ErrorKind::UnsupportedOperator,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Get the classified backend kind for query failures.
    pub fn backend_kind(&self) -> Option<BackendErrorKind> {
        match self {
            Self::Query { source } => Some(source.kind()),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The core never retries on its own; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionTimeout { .. } => true,
            Self::Query { source } => source.kind().is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorClassifier, RawError};
    use std::error::Error as _;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = DbError::pool_exhausted(4);
        assert!(err.to_string().contains("all 4 connections"));

        let err = DbError::connection_timeout(Duration::from_millis(250));
        assert_eq!(
            err.to_string(),
            "Timed out after 250ms waiting for a connection"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(DbError::PoolClosed.kind(), ErrorKind::PoolClosed);
        assert_eq!(DbError::double_release(3).kind(), ErrorKind::DoubleRelease);
        assert_eq!(
            DbError::invalid_identifier("a;b").kind(),
            ErrorKind::InvalidIdentifier
        );
        assert_eq!(ErrorKind::ConcurrentUse.to_string(), "concurrent_use");
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::connection_timeout(Duration::from_secs(1)).is_retryable());
        assert!(!DbError::PoolClosed.is_retryable());
        assert!(!DbError::pool_exhausted(1).is_retryable());
        assert!(!DbError::unsupported_operator("OR 1=1").is_retryable());
        assert!(!DbError::invalid_identifier("x y").is_retryable());
    }

    #[test]
    fn test_query_error_retryable_by_backend_kind() {
        let classifier = ErrorClassifier::postgres();

        let deadlock = DbError::query(
            classifier.classify(RawError::database("40P01", "deadlock detected")),
        );
        assert!(deadlock.is_retryable());
        assert_eq!(deadlock.backend_kind(), Some(BackendErrorKind::Deadlock));

        let unique = DbError::query(classifier.classify(RawError::database(
            "23505",
            "duplicate key value violates unique constraint",
        )));
        assert!(!unique.is_retryable());
        assert_eq!(unique.kind(), ErrorKind::Query);
    }

    #[test]
    fn test_query_error_exposes_cause() {
        let err = DbError::query(
            ErrorClassifier::postgres().classify(RawError::database("42P01", "relation missing")),
        );
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("undefined table"));
        assert!(source.contains("relation missing"));
    }
}
