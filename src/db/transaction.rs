//! Transaction state machine over one lease.
//!
//! ```text
//! NotStarted --begin()--> Active --commit()--> Committed   (terminal)
//!                         Active --rollback()--> RolledBack (terminal)
//!                         Active --execute() fails--> Failed
//!                         Failed --rollback()--> RolledBack (terminal)
//!                         Failed --commit()--> TransactionAborted error, no transition
//! ```
//!
//! A failed statement never rolls back on its own: the caller must call
//! [`TransactionContext::rollback`]. The context never releases its lease.

use crate::db::driver::Driver;
use crate::db::lease::Lease;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutput, Statement};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    NotStarted,
    Active,
    /// Still open on the server, but only `rollback()` is allowed.
    Failed,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// `Active` or its `Failed` sub-state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Isolation level requested at BEGIN (PostgreSQL syntax).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// BEGIN/COMMIT/ROLLBACK sequencing on a borrowed lease.
pub struct TransactionContext<'a, D: Driver> {
    lease: &'a Lease<D>,
    state: TransactionState,
    isolation: Option<IsolationLevel>,
}

impl<D: Driver> std::fmt::Debug for TransactionContext<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("lease_id", &self.lease.id())
            .field("state", &self.state)
            .field("isolation", &self.isolation)
            .finish()
    }
}

impl<'a, D: Driver> TransactionContext<'a, D> {
    pub fn new(lease: &'a Lease<D>) -> Self {
        Self {
            lease,
            state: TransactionState::NotStarted,
            isolation: None,
        }
    }

    /// Request an isolation level; BEGIN becomes `BEGIN ISOLATION LEVEL …`.
    pub fn with_isolation(lease: &'a Lease<D>, level: IsolationLevel) -> Self {
        Self {
            isolation: Some(level),
            ..Self::new(lease)
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn lease(&self) -> &'a Lease<D> {
        self.lease
    }

    fn expect_state(&self, expected: TransactionState, action: &str) -> DbResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DbError::invalid_state(format!(
                "cannot {} a transaction that is {}",
                action, self.state
            )))
        }
    }

    /// Issue BEGIN. Legal only once, from `NotStarted`.
    pub async fn begin(&mut self) -> DbResult<()> {
        self.expect_state(TransactionState::NotStarted, "begin")?;

        let sql = match self.isolation {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_string(),
        };
        self.lease.execute(&Statement::raw(sql)).await?;

        self.state = TransactionState::Active;
        self.lease.set_in_transaction(true);
        debug!(lease_id = self.lease.id(), isolation = ?self.isolation, "Transaction started");
        Ok(())
    }

    /// Run a statement inside the transaction.
    ///
    /// On failure the context enters `Failed` and the classified error is
    /// returned; from then on only `rollback()` is accepted.
    pub async fn execute(&mut self, statement: &Statement) -> DbResult<QueryOutput> {
        match self.state {
            TransactionState::Active => {}
            TransactionState::Failed => {
                return Err(DbError::transaction_aborted(
                    "a previous statement failed; roll back before continuing",
                ));
            }
            other => {
                return Err(DbError::invalid_state(format!(
                    "cannot execute in a transaction that is {}",
                    other
                )));
            }
        }

        match self.lease.execute(statement).await {
            Ok(output) => Ok(output),
            Err(e) => {
                // ConcurrentUse means the statement never ran.
                if !matches!(e, DbError::ConcurrentUse { .. }) {
                    self.state = TransactionState::Failed;
                    warn!(
                        lease_id = self.lease.id(),
                        error = %e,
                        "Statement failed, transaction must be rolled back"
                    );
                }
                Err(e)
            }
        }
    }

    /// Issue COMMIT. Legal only from a clean `Active` state.
    ///
    /// If COMMIT itself fails the context enters `Failed`.
    pub async fn commit(&mut self) -> DbResult<()> {
        if self.state == TransactionState::Failed {
            return Err(DbError::transaction_aborted(
                "cannot commit after a failed statement; roll back instead",
            ));
        }
        self.expect_state(TransactionState::Active, "commit")?;

        match self.lease.execute(&Statement::raw("COMMIT")).await {
            Ok(_) => {
                self.state = TransactionState::Committed;
                self.lease.set_in_transaction(false);
                info!(lease_id = self.lease.id(), "Transaction committed");
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                warn!(lease_id = self.lease.id(), error = %e, "COMMIT failed");
                Err(e)
            }
        }
    }

    /// Issue ROLLBACK. Legal from `Active` or `Failed`; a second call fails
    /// without reaching the server.
    ///
    /// The context ends `RolledBack` even if ROLLBACK fails; the lease is then
    /// marked broken so its connection is discarded on release.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if !self.state.is_active() {
            return Err(DbError::invalid_state(format!(
                "cannot roll back a transaction that is {}",
                self.state
            )));
        }

        let result = self.lease.execute(&Statement::raw("ROLLBACK")).await;
        self.state = TransactionState::RolledBack;
        match result {
            Ok(_) => {
                self.lease.set_in_transaction(false);
                info!(lease_id = self.lease.id(), "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.lease.mark_broken();
                warn!(lease_id = self.lease.id(), error = %e, "ROLLBACK failed");
                Err(e)
            }
        }
    }
}

impl<D: Driver> Drop for TransactionContext<'_, D> {
    fn drop(&mut self) {
        if self.state.is_active() {
            warn!(
                lease_id = self.lease.id(),
                state = %self.state,
                "Transaction dropped without commit or rollback, connection will be discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(TransactionState::Active.is_active());
        assert!(TransactionState::Failed.is_active());
        assert!(!TransactionState::NotStarted.is_active());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
        assert!(!TransactionState::Failed.is_terminal());
    }

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::RolledBack.to_string(), "rolled back");
        assert_eq!(
            serde_json::to_string(&TransactionState::NotStarted).unwrap(),
            "\"not_started\""
        );
    }
}
