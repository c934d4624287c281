//! Relational database client core.
//!
//! Four pieces that sit between application code and a database driver:
//!
//! - [`db::Pool`]: a bounded connection pool with FIFO waiting, idle reaping
//!   and graceful shutdown
//! - [`db::Lease`] and [`db::TransactionContext`]: exclusive use of one
//!   connection and the BEGIN/COMMIT/ROLLBACK state machine on it
//! - [`query::QueryBuilder`]: SELECT construction where identifiers are
//!   validated and every value becomes a positional parameter
//! - [`classify::ErrorClassifier`]: maps backend error codes to stable kinds
//!
//! PostgreSQL and SQLite are supported through [`db::SqlxDriver`]; other
//! backends plug in by implementing [`db::Driver`].

pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod query;

pub use classify::{BackendError, BackendErrorKind, ErrorClassifier, RawError};
pub use config::{Config, PoolConfig};
pub use db::{Lease, Pool, SqlxDriver, TransactionContext, TransactionState};
pub use error::{DbError, DbResult, ErrorKind};
pub use models::{ConnectionConfig, QueryOutput, Statement, Value};
pub use query::QueryBuilder;
