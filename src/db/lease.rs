//! Exclusive lease over one pooled connection.

use crate::db::driver::{Driver, DriverConnection};
use crate::db::pool::{ConnectionCell, PoolInner};
use crate::db::transaction::TransactionContext;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutput, Statement};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exclusive, single-use ownership of a pooled connection.
///
/// Returned by [`Pool::checkout`](super::Pool::checkout). Call
/// [`release`](Self::release) exactly once on every exit path; dropping an
/// unreleased lease releases it as a fallback and logs a warning.
///
/// `execute` takes `&self`, but only one statement may be in flight at a time:
/// a second concurrent call fails with `ConcurrentUse` instead of interleaving
/// on the wire.
///
/// A lease is discarded instead of returned to the idle set when its
/// connection was lost, when a statement was cancelled mid-flight, or when a
/// transaction is still open at release.
pub struct Lease<D: Driver> {
    pool: Arc<PoolInner<D>>,
    slot: usize,
    id: u64,
    cell: ConnectionCell<D::Connection>,
    leased_at: Instant,
    released: AtomicBool,
    broken: AtomicBool,
    in_transaction: AtomicBool,
}

impl<D: Driver> std::fmt::Debug for Lease<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("age", &self.age())
            .field("released", &self.is_released())
            .field("broken", &self.is_broken())
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

/// Marks the lease broken unless the statement ran to completion.
struct InFlight<'a> {
    broken: &'a AtomicBool,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(broken: &'a AtomicBool) -> Self {
        Self {
            broken,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.broken.store(true, Ordering::Release);
        }
    }
}

impl<D: Driver> Lease<D> {
    pub(crate) fn new(
        pool: Arc<PoolInner<D>>,
        slot: usize,
        id: u64,
        cell: ConnectionCell<D::Connection>,
    ) -> Self {
        Self {
            pool,
            slot,
            id,
            cell,
            leased_at: Instant::now(),
            released: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since checkout.
    pub fn age(&self) -> Duration {
        self.leased_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// True once the connection is known to be unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// True between a successful BEGIN and COMMIT/ROLLBACK.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_transaction(&self, open: bool) {
        self.in_transaction.store(open, Ordering::Release);
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Run one statement on the leased connection.
    ///
    /// A failed statement leaves the lease valid; the caller decides whether to
    /// retry, roll back or release. Backend errors are classified with the
    /// pool's [`ErrorClassifier`](crate::classify::ErrorClassifier).
    pub async fn execute(&self, statement: &Statement) -> DbResult<QueryOutput> {
        if self.is_released() {
            return Err(DbError::invalid_state(format!(
                "lease {} has been released",
                self.id
            )));
        }

        let mut guard = self
            .cell
            .try_lock()
            .map_err(|_| DbError::concurrent_use(self.id))?;
        let Some(conn) = (*guard).as_mut() else {
            // Force-closed by pool shutdown
            return Err(DbError::PoolClosed);
        };

        debug!(
            lease_id = self.id,
            sql = %statement.text(),
            params = statement.params().len(),
            "Executing statement"
        );

        let in_flight = InFlight::start(&self.broken);
        let result = conn.execute(statement).await;
        in_flight.finish();
        drop(guard);

        result.map_err(|raw| {
            if raw.connection_lost {
                self.mark_broken();
                warn!(
                    lease_id = self.id,
                    error = %raw,
                    "Connection lost, it will be discarded on release"
                );
            }
            let err = self.pool.classifier.classify(raw);
            debug!(lease_id = self.id, kind = %err.kind(), "Statement failed");
            DbError::query(err)
        })
    }

    /// Start a transaction on this lease.
    pub async fn begin(&self) -> DbResult<TransactionContext<'_, D>> {
        let mut tx = TransactionContext::new(self);
        tx.begin().await?;
        Ok(tx)
    }

    /// Return the connection to the pool.
    ///
    /// Fails with `DoubleRelease` when called more than once.
    pub fn release(&self) -> DbResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(DbError::double_release(self.id));
        }
        self.return_to_pool()
    }

    fn return_to_pool(&self) -> DbResult<()> {
        let open_transaction = self.in_transaction();
        if open_transaction {
            warn!(
                lease_id = self.id,
                "Lease released inside an open transaction, discarding connection"
            );
        }
        let discard = open_transaction || self.is_broken();
        self.pool.release_lease(self.slot, self.id, discard)
    }
}

impl<D: Driver> Drop for Lease<D> {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            lease_id = self.id,
            age_ms = self.age().as_millis() as u64,
            "Lease released via Drop - consider using explicit release()"
        );
        if let Err(e) = self.return_to_pool() {
            debug!(lease_id = self.id, error = %e, "Release on drop failed");
        }
    }
}
