//! Driver abstraction wrapped by the pool.
//!
//! The pool never speaks a wire protocol itself. A [`Driver`] opens physical
//! connections and a [`DriverConnection`] runs one statement at a time on
//! them, reporting failures as unclassified [`RawError`]s.

use crate::classify::{ErrorClassifier, RawError};
use crate::models::{QueryOutput, Statement};
use async_trait::async_trait;

/// Factory for physical connections.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Open a new physical connection.
    async fn connect(&self) -> Result<Self::Connection, RawError>;

    /// Code table used to classify this driver's errors.
    fn error_classifier(&self) -> ErrorClassifier {
        ErrorClassifier::new()
    }
}

/// One physical connection.
#[async_trait]
pub trait DriverConnection: Send + Sized + 'static {
    /// Run a single statement.
    async fn execute(&mut self, statement: &Statement) -> Result<QueryOutput, RawError>;

    /// Close the connection gracefully.
    async fn close(self) -> Result<(), RawError>;
}
