//! Backend error classification.
//!
//! Drivers report failures as [`RawError`] values carrying whatever the backend
//! returned (an SQLSTATE, an SQLite extended result code, or nothing at all).
//! [`ErrorClassifier`] maps those onto the stable [`BackendErrorKind`] set.
//! Classification is total: anything unrecognised becomes
//! [`BackendErrorKind::Unknown`].

use std::collections::HashMap;
use thiserror::Error;

/// Stable, backend-independent failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    UndefinedTable,
    UndefinedColumn,
    ConnectionFailure,
    Deadlock,
    Unknown,
}

impl BackendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniqueViolation => "unique violation",
            Self::ForeignKeyViolation => "foreign key violation",
            Self::NotNullViolation => "not null violation",
            Self::UndefinedTable => "undefined table",
            Self::UndefinedColumn => "undefined column",
            Self::ConnectionFailure => "connection failure",
            Self::Deadlock => "deadlock",
            Self::Unknown => "unknown",
        }
    }

    /// Transient conditions that may succeed when the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailure | Self::Deadlock)
    }
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unclassified failure reported by a driver.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct RawError {
    /// Backend code, e.g. "23505" (PostgreSQL) or "2067" (SQLite)
    pub code: Option<String>,
    pub message: String,
    /// Set for I/O-level failures; the connection must not be reused.
    pub connection_lost: bool,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RawError {
    /// Create a raw error without a backend code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            connection_lost: false,
            source: None,
        }
    }

    /// Create a raw error carrying a backend code.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::new(message)
        }
    }

    /// Create a raw error for a broken or unreachable connection.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            connection_lost: true,
            ..Self::new(message)
        }
    }

    /// Attach the underlying driver error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl From<sqlx::Error> for RawError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let message = db_err.message().to_string();
                RawError {
                    code,
                    message,
                    connection_lost: false,
                    source: Some(Box::new(sqlx::Error::Database(db_err))),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                RawError::connection_lost(err.to_string()).with_source(err)
            }
            other => RawError::new(other.to_string()).with_source(other),
        }
    }
}

/// A raw error together with its classified kind.
#[derive(Error, Debug)]
#[error("{kind}: {raw}")]
pub struct BackendError {
    kind: BackendErrorKind,
    #[source]
    raw: RawError,
}

impl BackendError {
    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<&str> {
        self.raw.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.raw.message
    }

    pub fn raw(&self) -> &RawError {
        &self.raw
    }
}

/// Backend-specific mapping table from raw codes to [`BackendErrorKind`].
///
/// Lookup order: connection-lost flag, exact code, code prefix (SQLSTATE
/// class), then case-insensitive message fragments.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    codes: HashMap<String, BackendErrorKind>,
    code_prefixes: Vec<(String, BackendErrorKind)>,
    message_patterns: Vec<(String, BackendErrorKind)>,
}

impl ErrorClassifier {
    /// Create an empty classifier; everything maps to `Unknown` unless flagged
    /// as a lost connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// SQLSTATE table for PostgreSQL.
    pub fn postgres() -> Self {
        Self::new()
            .with_code("23505", BackendErrorKind::UniqueViolation)
            .with_code("23503", BackendErrorKind::ForeignKeyViolation)
            .with_code("23502", BackendErrorKind::NotNullViolation)
            .with_code("42P01", BackendErrorKind::UndefinedTable)
            .with_code("42703", BackendErrorKind::UndefinedColumn)
            .with_code("40P01", BackendErrorKind::Deadlock)
            // serialization_failure: same remedy as a deadlock
            .with_code("40001", BackendErrorKind::Deadlock)
            .with_code("57P01", BackendErrorKind::ConnectionFailure)
            .with_code_prefix("08", BackendErrorKind::ConnectionFailure)
    }

    /// Extended result codes and message patterns for SQLite.
    ///
    /// Missing tables and columns are reported with the generic SQLITE_ERROR
    /// code, so those are recognised by message.
    pub fn sqlite() -> Self {
        Self::new()
            .with_code("2067", BackendErrorKind::UniqueViolation)
            .with_code("1555", BackendErrorKind::UniqueViolation)
            .with_code("787", BackendErrorKind::ForeignKeyViolation)
            .with_code("1299", BackendErrorKind::NotNullViolation)
            // SQLITE_BUSY / SQLITE_LOCKED
            .with_code("5", BackendErrorKind::Deadlock)
            .with_code("6", BackendErrorKind::Deadlock)
            .with_message_pattern("no such table", BackendErrorKind::UndefinedTable)
            .with_message_pattern("no such column", BackendErrorKind::UndefinedColumn)
            .with_message_pattern("unique constraint failed", BackendErrorKind::UniqueViolation)
            .with_message_pattern(
                "foreign key constraint failed",
                BackendErrorKind::ForeignKeyViolation,
            )
            .with_message_pattern("not null constraint failed", BackendErrorKind::NotNullViolation)
    }

    /// Map an exact backend code.
    pub fn with_code(mut self, code: impl Into<String>, kind: BackendErrorKind) -> Self {
        self.codes.insert(code.into(), kind);
        self
    }

    /// Map every code starting with `prefix`.
    pub fn with_code_prefix(mut self, prefix: impl Into<String>, kind: BackendErrorKind) -> Self {
        self.code_prefixes.push((prefix.into(), kind));
        self
    }

    /// Map messages containing `pattern` (case-insensitive).
    pub fn with_message_pattern(
        mut self,
        pattern: impl Into<String>,
        kind: BackendErrorKind,
    ) -> Self {
        self.message_patterns
            .push((pattern.into().to_lowercase(), kind));
        self
    }

    /// Determine the kind for a raw error without consuming it.
    pub fn kind_of(&self, raw: &RawError) -> BackendErrorKind {
        if raw.connection_lost {
            return BackendErrorKind::ConnectionFailure;
        }

        if let Some(code) = raw.code.as_deref().map(str::trim) {
            if let Some(kind) = self.codes.get(code) {
                return *kind;
            }
            if let Some((_, kind)) = self
                .code_prefixes
                .iter()
                .find(|(prefix, _)| code.starts_with(prefix.as_str()))
            {
                return *kind;
            }
        }

        let message = raw.message.to_lowercase();
        self.message_patterns
            .iter()
            .find(|(pattern, _)| message.contains(pattern.as_str()))
            .map(|(_, kind)| *kind)
            .unwrap_or(BackendErrorKind::Unknown)
    }

    /// Classify a raw driver error.
    pub fn classify(&self, raw: RawError) -> BackendError {
        let kind = self.kind_of(&raw);
        BackendError { kind, raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_codes() {
        let c = ErrorClassifier::postgres();
        let cases = [
            ("23505", BackendErrorKind::UniqueViolation),
            ("23503", BackendErrorKind::ForeignKeyViolation),
            ("23502", BackendErrorKind::NotNullViolation),
            ("42P01", BackendErrorKind::UndefinedTable),
            ("42703", BackendErrorKind::UndefinedColumn),
            ("40P01", BackendErrorKind::Deadlock),
            ("08006", BackendErrorKind::ConnectionFailure),
            ("08001", BackendErrorKind::ConnectionFailure),
        ];
        for (code, expected) in cases {
            assert_eq!(c.kind_of(&RawError::database(code, "x")), expected, "{code}");
        }
    }

    #[test]
    fn test_sqlite_codes_and_messages() {
        let c = ErrorClassifier::sqlite();
        assert_eq!(
            c.kind_of(&RawError::database(
                "2067",
                "UNIQUE constraint failed: users.email"
            )),
            BackendErrorKind::UniqueViolation
        );
        assert_eq!(
            c.kind_of(&RawError::database("1299", "NOT NULL constraint failed: t.a")),
            BackendErrorKind::NotNullViolation
        );
        assert_eq!(
            c.kind_of(&RawError::database("1", "no such table: accounts")),
            BackendErrorKind::UndefinedTable
        );
        assert_eq!(
            c.kind_of(&RawError::database("1", "no such column: balanse")),
            BackendErrorKind::UndefinedColumn
        );
        assert_eq!(
            c.kind_of(&RawError::new("FOREIGN KEY constraint failed")),
            BackendErrorKind::ForeignKeyViolation
        );
    }

    #[test]
    fn test_classify_is_total() {
        let c = ErrorClassifier::postgres();
        assert_eq!(
            c.kind_of(&RawError::database("99999", "mystery")),
            BackendErrorKind::Unknown
        );
        assert_eq!(c.kind_of(&RawError::database("", "")), BackendErrorKind::Unknown);
        assert_eq!(
            c.kind_of(&RawError::database("\u{0}garbage\u{7f}", "\u{fffd}")),
            BackendErrorKind::Unknown
        );
        assert_eq!(
            ErrorClassifier::new().kind_of(&RawError::database("23505", "dup")),
            BackendErrorKind::Unknown
        );
    }

    #[test]
    fn test_connection_lost_wins() {
        let c = ErrorClassifier::postgres();
        let mut raw = RawError::connection_lost("broken pipe");
        raw.code = Some("23505".to_string());
        assert_eq!(c.kind_of(&raw), BackendErrorKind::ConnectionFailure);
        assert_eq!(
            ErrorClassifier::new().kind_of(&RawError::connection_lost("reset")),
            BackendErrorKind::ConnectionFailure
        );
    }

    #[test]
    fn test_custom_table() {
        let c = ErrorClassifier::new()
            .with_code("1062", BackendErrorKind::UniqueViolation)
            .with_message_pattern("Lock wait timeout", BackendErrorKind::Deadlock);
        assert_eq!(
            c.kind_of(&RawError::database("1062", "Duplicate entry")),
            BackendErrorKind::UniqueViolation
        );
        assert_eq!(
            c.kind_of(&RawError::new("lock wait timeout exceeded")),
            BackendErrorKind::Deadlock
        );
    }

    #[test]
    fn test_classify_keeps_raw_details() {
        let err = ErrorClassifier::postgres().classify(RawError::database("23505", "dup key"));
        assert_eq!(err.kind(), BackendErrorKind::UniqueViolation);
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.message(), "dup key");
        assert_eq!(err.to_string(), "unique violation: dup key");
    }

    #[test]
    fn test_from_sqlx_io_error_is_connection_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let raw = RawError::from(sqlx::Error::Io(io));
        assert!(raw.connection_lost);
        assert_eq!(
            ErrorClassifier::sqlite().kind_of(&raw),
            BackendErrorKind::ConnectionFailure
        );
    }

    #[test]
    fn test_from_sqlx_row_not_found_is_unknown() {
        let raw = RawError::from(sqlx::Error::RowNotFound);
        assert!(!raw.connection_lost);
        assert!(raw.code.is_none());
        assert_eq!(
            ErrorClassifier::postgres().kind_of(&raw),
            BackendErrorKind::Unknown
        );
    }
}
