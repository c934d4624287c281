//! Connection pooling and transactions.
//!
//! - `driver`: the [`Driver`]/[`DriverConnection`] seam the pool is generic over
//! - `pool`: bounded pool, wait queue, idle reaper and shutdown
//! - `lease`: exclusive ownership of one pooled connection
//! - `transaction`: BEGIN/COMMIT/ROLLBACK state machine on a lease
//! - `sqlx_driver`: PostgreSQL and SQLite driver built on sqlx
//! - `types`: sqlx row decoding into JSON

pub mod driver;
pub mod lease;
pub mod pool;
pub mod sqlx_driver;
pub mod transaction;
pub mod types;

pub use driver::{Driver, DriverConnection};
pub use lease::Lease;
pub use pool::{
    ConnectionState, LeaseInfo, Pool, PoolBuilder, PoolMetrics, PoolStatus, ShutdownReport,
};
pub use sqlx_driver::{SqlxConnection, SqlxDriver};
pub use transaction::{IsolationLevel, TransactionContext, TransactionState};
