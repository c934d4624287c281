//! Bounded connection pool.
//!
//! # Design Decisions
//!
//! - **Slot arena**: every physical connection lives in an index-addressable
//!   slot with an explicit [`ConnectionState`] (`Idle`, `Leased`, `Closed`).
//!   Closed slots are recycled through a free list.
//! - **One bookkeeping lock**: slots, counters and the wait queue sit behind a
//!   single `parking_lot::Mutex` that is never held across an `.await`.
//!   Connections are opened and closed outside of it.
//! - **FIFO handoff**: a blocked checkout parks a `oneshot` sender in the wait
//!   queue. `release` hands the connection (or, when the connection was
//!   discarded, the freed capacity) to the oldest live waiter while still
//!   holding the lock, so a handoff and a timeout can never both win.
//! - **Weak reaper**: the idle reaper task holds a `Weak` reference and exits
//!   once the pool is dropped or shut down.
//!
//! # Invariants
//!
//! - `active <= total <= max_connections`
//! - `total` counts idle and leased slots plus connections being opened
//! - a slot is either in the idle queue, held by exactly one lease, or closed
//! - a checkout that times out or is cancelled leaves no trace: it is removed
//!   from the queue, and any capacity or connection granted to it meanwhile is
//!   passed on
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> db_client_core::error::DbResult<()> {
//! use db_client_core::config::PoolConfig;
//! use db_client_core::db::{Pool, SqlxDriver};
//! use db_client_core::models::{ConnectionConfig, Statement};
//!
//! let config = ConnectionConfig::parse("postgres://app@localhost/orders")
//!     .map_err(|e| db_client_core::error::DbError::config(e.to_string()))?;
//! let pool = Pool::new(SqlxDriver::new(config.clone()), config.pool_config())?;
//!
//! let lease = pool.checkout().await?;
//! lease.execute(&Statement::raw("SELECT 1")).await?;
//! lease.release()?;
//!
//! pool.shutdown(std::time::Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

use crate::classify::ErrorClassifier;
use crate::config::PoolConfig;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::lease::Lease;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutput, Statement};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared holder of one physical connection.
///
/// The inner `Option` is emptied when the connection is closed; the async
/// mutex serializes statements on the connection.
pub(crate) type ConnectionCell<C> = Arc<tokio::sync::Mutex<Option<C>>>;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Leased,
    Closed,
}

struct Slot<C> {
    state: ConnectionState,
    cell: ConnectionCell<C>,
    lease_id: Option<u64>,
    created_at: Instant,
    idle_since: Instant,
    leased_at: Option<(Instant, DateTime<Utc>)>,
}

/// A slot handed to a checkout, already marked `Leased`.
pub(crate) struct Checkout<C> {
    slot: usize,
    lease_id: u64,
    cell: ConnectionCell<C>,
}

/// What `release` passes to a queued checkout.
enum Grant<C> {
    Connection(Checkout<C>),
    /// Room for one new connection; `total` already counts it.
    Capacity,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

struct PoolState<C> {
    slots: Vec<Slot<C>>,
    free_slots: Vec<usize>,
    idle: VecDeque<usize>,
    total: usize,
    active: usize,
    waiters: VecDeque<Waiter<C>>,
    next_waiter_id: u64,
    next_lease_id: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            idle: VecDeque::new(),
            total: 0,
            active: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 0,
            next_lease_id: 1,
            closed: false,
        }
    }

    fn insert_slot(&mut self, cell: ConnectionCell<C>) -> usize {
        let now = Instant::now();
        let slot = Slot {
            state: ConnectionState::Idle,
            cell,
            lease_id: None,
            created_at: now,
            idle_since: now,
            leased_at: None,
        };
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn lease_slot(&mut self, idx: usize) -> Checkout<C> {
        let lease_id = self.next_lease_id;
        self.next_lease_id += 1;
        self.active += 1;

        let slot = &mut self.slots[idx];
        slot.state = ConnectionState::Leased;
        slot.lease_id = Some(lease_id);
        slot.leased_at = Some((Instant::now(), Utc::now()));
        Checkout {
            slot: idx,
            lease_id,
            cell: Arc::clone(&slot.cell),
        }
    }

    fn mark_idle(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.state = ConnectionState::Idle;
        slot.lease_id = None;
        slot.leased_at = None;
        slot.idle_since = Instant::now();
    }

    /// Close a slot and give its capacity back. The caller closes the
    /// returned cell outside the lock.
    fn close_slot(&mut self, idx: usize) -> ConnectionCell<C> {
        let slot = &mut self.slots[idx];
        slot.state = ConnectionState::Closed;
        slot.lease_id = None;
        slot.leased_at = None;
        self.free_slots.push(idx);
        self.total -= 1;
        Arc::clone(&slot.cell)
    }

    /// Hand an idle slot to the oldest live waiter.
    fn hand_off_slot(&mut self, idx: usize) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            let checkout = self.lease_slot(idx);
            match waiter.tx.send(Grant::Connection(checkout)) {
                Ok(()) => return true,
                Err(_) => {
                    self.active -= 1;
                    self.mark_idle(idx);
                }
            }
        }
        false
    }

    /// Hand one unit of free capacity to the oldest live waiter.
    fn hand_off_capacity(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(Grant::Capacity).is_ok() {
                return true;
            }
        }
        false
    }
}

/// Point-in-time pool counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub max_connections: usize,
    pub closed: bool,
}

impl PoolStatus {
    /// Fraction of `max_connections` currently leased.
    pub fn utilization(&self) -> f64 {
        self.active as f64 / self.max_connections as f64
    }

    /// True when a checkout would have to wait.
    pub fn is_at_capacity(&self) -> bool {
        self.idle == 0 && self.total >= self.max_connections
    }
}

/// Cumulative pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    pub checkouts: u64,
    pub checkout_timeouts: u64,
    pub checkouts_rejected: u64,
    pub releases: u64,
    pub discarded: u64,
    pub reaped: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connect_failures: AtomicU64,
    checkouts: AtomicU64,
    checkout_timeouts: AtomicU64,
    checkouts_rejected: AtomicU64,
    releases: AtomicU64,
    discarded: AtomicU64,
    reaped: AtomicU64,
}

impl PoolCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolMetrics {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolMetrics {
            connections_opened: get(&self.connections_opened),
            connections_closed: get(&self.connections_closed),
            connect_failures: get(&self.connect_failures),
            checkouts: get(&self.checkouts),
            checkout_timeouts: get(&self.checkout_timeouts),
            checkouts_rejected: get(&self.checkouts_rejected),
            releases: get(&self.releases),
            discarded: get(&self.discarded),
            reaped: get(&self.reaped),
        }
    }
}

/// Diagnostic view of an outstanding lease.
///
/// Long-lived entries usually mean a caller forgot to release; the pool
/// reports them but never reclaims them before shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseInfo {
    pub lease_id: u64,
    pub slot: usize,
    pub leased_at: DateTime<Utc>,
    pub age: Duration,
    pub connection_age: Duration,
}

/// Outcome of [`Pool::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Idle connections closed immediately
    pub idle_closed: usize,
    /// Leases returned during the grace period
    pub drained: usize,
    /// Connections still leased when the grace period ran out
    pub force_closed: usize,
}

pub(crate) struct PoolInner<D: Driver> {
    driver: D,
    config: PoolConfig,
    pub(crate) classifier: ErrorClassifier,
    state: Mutex<PoolState<D::Connection>>,
    lease_returned: Notify,
    counters: PoolCounters,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Driver> PoolInner<D> {
    /// Return a leased slot. Called by [`Lease::release`] and its `Drop`.
    pub(crate) fn release_lease(&self, slot: usize, lease_id: u64, discard: bool) -> DbResult<()> {
        let mut to_close = None;
        {
            let mut state = self.state.lock();
            let valid = state.slots.get(slot).is_some_and(|s| {
                s.state == ConnectionState::Leased && s.lease_id == Some(lease_id)
            });
            if !valid {
                // Force-closed by shutdown after the grace period.
                if state.closed {
                    return Ok(());
                }
                return Err(DbError::double_release(lease_id));
            }

            state.active -= 1;
            let held_ms = state.slots[slot]
                .leased_at
                .map(|(at, _)| at.elapsed().as_millis() as u64)
                .unwrap_or_default();
            // A statement still running means the wire state is unknown.
            let busy = state.slots[slot].cell.try_lock().is_err();

            if discard || busy || state.closed {
                to_close = Some(state.close_slot(slot));
                // The freed capacity moves to the oldest waiter, if any.
                if !state.closed && state.hand_off_capacity() {
                    state.total += 1;
                }
                debug!(
                    lease_id,
                    slot,
                    held_ms,
                    broken = discard,
                    busy,
                    "Discarding connection on release"
                );
            } else {
                state.mark_idle(slot);
                if !state.hand_off_slot(slot) {
                    state.idle.push_back(slot);
                }
                debug!(lease_id, slot, held_ms, "Lease released");
            }
        }

        PoolCounters::bump(&self.counters.releases);
        self.lease_returned.notify_waiters();

        if let Some(cell) = to_close {
            PoolCounters::bump(&self.counters.discarded);
            PoolCounters::bump(&self.counters.connections_closed);
            close_in_background(cell);
        }
        Ok(())
    }

    /// Give back capacity reserved for a connection that was never opened.
    fn release_reservation(&self) {
        let mut state = self.state.lock();
        if state.closed || !state.hand_off_capacity() {
            state.total -= 1;
        }
    }

    fn return_grant(&self, grant: Grant<D::Connection>) {
        match grant {
            Grant::Connection(checkout) => {
                let _ = self.release_lease(checkout.slot, checkout.lease_id, false);
            }
            Grant::Capacity => self.release_reservation(),
        }
    }

    /// Close idle connections past `idle_timeout`.
    fn collect_expired(&self, idle_timeout: Duration) -> Vec<ConnectionCell<D::Connection>> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }

        let now = Instant::now();
        let (expired, kept): (Vec<usize>, Vec<usize>) =
            state.idle.iter().copied().partition(|&idx| {
                now.saturating_duration_since(state.slots[idx].idle_since) >= idle_timeout
            });
        state.idle = kept.into();
        expired
            .into_iter()
            .map(|idx| state.close_slot(idx))
            .collect()
    }
}

impl<D: Driver> Drop for PoolInner<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Close a connection without holding any pool lock.
async fn close_cell<C: DriverConnection>(cell: ConnectionCell<C>) {
    let conn = cell.lock().await.take();
    if let Some(conn) = conn {
        close_connection(conn).await;
    }
}

async fn close_connection<C: DriverConnection>(conn: C) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Error while closing connection");
    }
}

/// Close from synchronous code. Without a runtime the connection is dropped.
fn close_in_background<C: DriverConnection>(cell: ConnectionCell<C>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(close_cell(cell));
        }
        Err(_) => {
            if let Ok(mut guard) = cell.try_lock() {
                guard.take();
            }
        }
    }
}

/// Capacity counted in `total` for a connection being opened.
struct Reservation<'a, D: Driver> {
    inner: &'a PoolInner<D>,
    armed: bool,
}

impl<'a, D: Driver> Reservation<'a, D> {
    fn new(inner: &'a PoolInner<D>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<D: Driver> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_reservation();
        }
    }
}

/// A checkout parked in the wait queue.
struct QueuedCheckout<'a, D: Driver> {
    inner: &'a PoolInner<D>,
    id: u64,
    rx: oneshot::Receiver<Grant<D::Connection>>,
    done: bool,
}

enum Departure<C> {
    /// Removed from the queue before anything was granted.
    Left,
    /// A grant arrived before the waiter could leave.
    Granted(Grant<C>),
    /// The pool shut down.
    Closed,
}

impl<D: Driver> QueuedCheckout<'_, D> {
    /// Leave the queue. Handoffs and shutdown dequeue under the same lock,
    /// so a waiter that is no longer queued already has its answer.
    fn leave(&mut self) -> Departure<D::Connection> {
        self.done = true;
        {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
                state.waiters.remove(pos);
                return Departure::Left;
            }
        }
        match self.rx.try_recv() {
            Ok(grant) => Departure::Granted(grant),
            Err(TryRecvError::Closed) => Departure::Closed,
            Err(TryRecvError::Empty) => Departure::Left,
        }
    }
}

impl<D: Driver> Drop for QueuedCheckout<'_, D> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Departure::Granted(grant) = self.leave() {
            debug!(waiter = self.id, "Checkout cancelled after grant, passing it on");
            self.inner.return_grant(grant);
        }
    }
}

enum Admission<C> {
    Ready(Checkout<C>),
    Create,
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

/// Bounded pool of driver connections.
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Pool<D> {
    /// Create a pool using the driver's error classifier.
    ///
    /// Must be called within a tokio runtime when idle reaping is enabled.
    pub fn new(driver: D, config: PoolConfig) -> DbResult<Self> {
        let classifier = driver.error_classifier();
        Self::with_classifier(driver, config, classifier)
    }

    /// Create a pool with an explicit error classifier.
    pub fn with_classifier(
        driver: D,
        config: PoolConfig,
        classifier: ErrorClassifier,
    ) -> DbResult<Self> {
        config.validate().map_err(DbError::config)?;

        let inner = Arc::new(PoolInner {
            driver,
            config,
            classifier,
            state: Mutex::new(PoolState::new()),
            lease_returned: Notify::new(),
            counters: PoolCounters::default(),
            reaper: Mutex::new(None),
        });

        if let (Some(idle_timeout), Some(interval)) = (
            inner.config.idle_timeout,
            inner.config.reap_interval_or_default(),
        ) {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                DbError::config("idle reaping requires a running tokio runtime")
            })?;
            // Weak reference so the reaper never keeps the pool alive
            let weak = Arc::downgrade(&inner);
            let handle = runtime.spawn(Self::reap_idle(weak, interval, idle_timeout));
            *inner.reaper.lock() = Some(handle);
        }

        info!(
            max_connections = inner.config.max_connections,
            idle_timeout_ms = ?inner.config.idle_timeout.map(|t| t.as_millis()),
            connection_timeout_ms = ?inner.config.connection_timeout.map(|t| t.as_millis()),
            "Connection pool created"
        );

        Ok(Self { inner })
    }

    /// Start building a pool with default settings.
    pub fn builder(driver: D) -> PoolBuilder<D> {
        PoolBuilder::new(driver)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.inner.classifier
    }

    /// Lease a connection, waiting at most `connection_timeout`.
    pub async fn checkout(&self) -> DbResult<Lease<D>> {
        self.acquire(self.inner.config.connection_timeout, true)
            .await
    }

    /// Lease a connection, waiting at most `timeout`.
    pub async fn checkout_timeout(&self, timeout: Duration) -> DbResult<Lease<D>> {
        self.acquire(Some(timeout), true).await
    }

    /// Lease a connection without queueing.
    ///
    /// Fails with `PoolExhausted` when no connection is idle and the pool is
    /// at `max_connections`. May still open a new connection.
    pub async fn try_checkout(&self) -> DbResult<Lease<D>> {
        self.acquire(self.inner.config.connection_timeout, false)
            .await
    }

    async fn acquire(&self, timeout: Option<Duration>, queue: bool) -> DbResult<Lease<D>> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let max = self.inner.config.max_connections;

        let admission = {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                PoolCounters::bump(&self.inner.counters.checkouts_rejected);
                return Err(DbError::PoolClosed);
            }
            // Most recently used first so surplus connections age out
            if let Some(idx) = state.idle.pop_back() {
                Admission::Ready(state.lease_slot(idx))
            } else if state.total < max {
                state.total += 1;
                Admission::Create
            } else if !queue
                || self
                    .inner
                    .config
                    .max_waiting
                    .is_some_and(|limit| state.waiters.len() >= limit)
            {
                drop(state);
                PoolCounters::bump(&self.inner.counters.checkouts_rejected);
                return Err(DbError::pool_exhausted(max));
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter { id, tx });
                debug!(waiter = id, queued = state.waiters.len(), "Pool at capacity, queueing checkout");
                Admission::Wait(id, rx)
            }
        };

        let result = match admission {
            Admission::Ready(checkout) => Ok(self.lease_from(checkout)),
            Admission::Create => {
                self.open_connection(Reservation::new(&self.inner), started, deadline)
                    .await
            }
            Admission::Wait(id, rx) => self.wait_for_grant(id, rx, started, deadline).await,
        };

        match &result {
            Ok(lease) => {
                PoolCounters::bump(&self.inner.counters.checkouts);
                debug!(
                    lease_id = lease.id(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Connection checked out"
                );
            }
            Err(DbError::ConnectionTimeout { .. }) => {
                PoolCounters::bump(&self.inner.counters.checkout_timeouts);
            }
            Err(DbError::PoolClosed) => {
                PoolCounters::bump(&self.inner.counters.checkouts_rejected);
            }
            Err(_) => {}
        }
        result
    }

    async fn wait_for_grant(
        &self,
        id: u64,
        rx: oneshot::Receiver<Grant<D::Connection>>,
        started: Instant,
        deadline: Option<Instant>,
    ) -> DbResult<Lease<D>> {
        let mut queued = QueuedCheckout {
            inner: &self.inner,
            id,
            rx,
            done: false,
        };

        let received = match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, &mut queued.rx).await {
                    Ok(received) => received.ok(),
                    Err(_) => match queued.leave() {
                        // A release won the race; keep what it handed over.
                        Departure::Granted(grant) => Some(grant),
                        Departure::Closed => None,
                        Departure::Left => {
                            debug!(waiter = id, "Checkout timed out");
                            return Err(DbError::connection_timeout(started.elapsed()));
                        }
                    },
                }
            }
            None => (&mut queued.rx).await.ok(),
        };
        queued.done = true;

        match received {
            Some(Grant::Connection(checkout)) => Ok(self.lease_from(checkout)),
            Some(Grant::Capacity) => {
                self.open_connection(Reservation::new(&self.inner), started, deadline)
                    .await
            }
            // Sender dropped: the pool is shutting down.
            None => Err(DbError::PoolClosed),
        }
    }

    async fn open_connection(
        &self,
        reservation: Reservation<'_, D>,
        started: Instant,
        deadline: Option<Instant>,
    ) -> DbResult<Lease<D>> {
        let connect = self.inner.driver.connect();
        let connected = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), connect)
                    .await
                {
                    Ok(connected) => connected,
                    Err(_) => return Err(DbError::connection_timeout(started.elapsed())),
                }
            }
            None => connect.await,
        };

        let conn = match connected {
            Ok(conn) => conn,
            Err(raw) => {
                PoolCounters::bump(&self.inner.counters.connect_failures);
                let err = self.inner.classifier.classify(raw);
                warn!(error = %err, "Failed to open connection");
                return Err(DbError::query(err));
            }
        };
        PoolCounters::bump(&self.inner.counters.connections_opened);

        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            drop(reservation);
            PoolCounters::bump(&self.inner.counters.connections_closed);
            close_in_background(Arc::new(tokio::sync::Mutex::new(Some(conn))));
            return Err(DbError::PoolClosed);
        }
        let idx = state.insert_slot(Arc::new(tokio::sync::Mutex::new(Some(conn))));
        let checkout = state.lease_slot(idx);
        let total = state.total;
        drop(state);
        reservation.disarm();

        info!(slot = idx, total, "Opened new connection");
        Ok(self.lease_from(checkout))
    }

    fn lease_from(&self, checkout: Checkout<D::Connection>) -> Lease<D> {
        Lease::new(
            Arc::clone(&self.inner),
            checkout.slot,
            checkout.lease_id,
            checkout.cell,
        )
    }

    /// Run one statement on a pooled connection.
    ///
    /// The lease is released on every path, including statement failure.
    pub async fn query(&self, statement: &Statement) -> DbResult<QueryOutput> {
        let lease = self.checkout().await?;
        let result = lease.execute(statement).await;
        if let Err(e) = lease.release() {
            warn!(lease_id = lease.id(), error = %e, "Failed to release lease after query");
        }
        result
    }

    /// Current counts.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            total: state.total,
            active: state.active,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            max_connections: self.inner.config.max_connections,
            closed: state.closed,
        }
    }

    /// Cumulative counters since the pool was created.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.counters.snapshot()
    }

    /// Outstanding leases, oldest first.
    pub fn leases(&self) -> Vec<LeaseInfo> {
        let state = self.inner.state.lock();
        let mut leases: Vec<LeaseInfo> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == ConnectionState::Leased)
            .filter_map(|(idx, slot)| {
                let (at, wall) = slot.leased_at?;
                Some(LeaseInfo {
                    lease_id: slot.lease_id?,
                    slot: idx,
                    leased_at: wall,
                    age: at.elapsed(),
                    connection_age: slot.created_at.elapsed(),
                })
            })
            .collect();
        leases.sort_by(|a, b| b.age.cmp(&a.age));
        leases
    }

    /// State of every slot in the arena, indexed by slot.
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .map(|slot| slot.state)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Stop admissions, drain outstanding leases for up to `grace`, then
    /// force-close whatever is still leased.
    ///
    /// Pending and later checkouts fail with `PoolClosed`. Calling this again
    /// is harmless.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let (idle_cells, outstanding, already_closed) = {
            let mut state = self.inner.state.lock();
            let already_closed = std::mem::replace(&mut state.closed, true);
            // Dropping the senders wakes queued checkouts with PoolClosed.
            state.waiters.clear();
            let idle: Vec<usize> = state.idle.drain(..).collect();
            let cells: Vec<_> = idle.into_iter().map(|idx| state.close_slot(idx)).collect();
            (cells, state.active, already_closed)
        };

        if !already_closed {
            info!(
                idle = idle_cells.len(),
                outstanding,
                grace_ms = grace.as_millis() as u64,
                "Shutting down connection pool"
            );
        }
        let idle_closed = idle_cells.len();
        PoolCounters::add(&self.inner.counters.connections_closed, idle_closed);
        join_all(idle_cells.into_iter().map(close_cell)).await;

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.inner.lease_returned.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            if self.inner.state.lock().active == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let forced: Vec<_> = {
            let mut state = self.inner.state.lock();
            let leased: Vec<usize> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.state == ConnectionState::Leased)
                .map(|(idx, _)| idx)
                .collect();
            leased
                .into_iter()
                .map(|idx| {
                    state.active -= 1;
                    state.close_slot(idx)
                })
                .collect()
        };

        let force_closed = forced.len();
        if force_closed > 0 {
            warn!(
                count = force_closed,
                "Force-closing connections still leased after grace period"
            );
            PoolCounters::add(&self.inner.counters.connections_closed, force_closed);
        }
        let mut detached = Vec::with_capacity(force_closed);
        for cell in forced {
            // Detach unused cells now so the holder's next statement sees PoolClosed.
            let taken = cell.try_lock().ok().map(|mut guard| guard.take());
            match taken {
                Some(conn) => detached.extend(conn),
                // A statement is still running; close once it finishes.
                None => close_in_background(cell),
            }
        }
        join_all(detached.into_iter().map(close_connection)).await;

        if let Some(handle) = self.inner.reaper.lock().take() {
            handle.abort();
        }

        if !already_closed {
            info!(idle_closed, force_closed, "Connection pool shut down");
        }
        ShutdownReport {
            idle_closed,
            drained: outstanding.saturating_sub(force_closed),
            force_closed,
        }
    }

    /// Background task closing connections idle for longer than `idle_timeout`.
    ///
    /// Uses a Weak reference to the pool; the task exits when the pool is
    /// dropped. Never touches leased connections.
    async fn reap_idle(weak: Weak<PoolInner<D>>, interval: Duration, idle_timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(inner) = weak.upgrade() else {
                debug!("Pool dropped, idle reaper exiting");
                return;
            };

            let expired = inner.collect_expired(idle_timeout);
            if !expired.is_empty() {
                info!(count = expired.len(), "Closing idle connections");
                PoolCounters::add(&inner.counters.reaped, expired.len());
                PoolCounters::add(&inner.counters.connections_closed, expired.len());
            }

            // Drop strong reference before closing and sleeping
            drop(inner);
            join_all(expired.into_iter().map(close_cell)).await;
        }
    }
}

/// Fluent constructor for [`Pool`].
pub struct PoolBuilder<D: Driver> {
    driver: D,
    config: PoolConfig,
    classifier: Option<ErrorClassifier>,
}

impl<D: Driver> PoolBuilder<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            config: PoolConfig::default(),
            classifier: None,
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// `None` disables idle reaping.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// `None` waits indefinitely.
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = Some(interval);
        self
    }

    pub fn max_waiting(mut self, limit: usize) -> Self {
        self.config.max_waiting = Some(limit);
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> DbResult<Pool<D>> {
        let classifier = self
            .classifier
            .unwrap_or_else(|| self.driver.error_classifier());
        Pool::with_classifier(self.driver, self.config, classifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell() -> ConnectionCell<()> {
        Arc::new(tokio::sync::Mutex::new(Some(())))
    }

    #[test]
    fn test_slot_reuse_after_close() {
        let mut state: PoolState<()> = PoolState::new();
        state.total = 2;
        let a = state.insert_slot(cell());
        let b = state.insert_slot(cell());
        assert_eq!((a, b), (0, 1));

        state.close_slot(a);
        assert_eq!(state.total, 1);
        assert_eq!(state.slots[a].state, ConnectionState::Closed);

        state.total += 1;
        let c = state.insert_slot(cell());
        assert_eq!(c, a);
        assert_eq!(state.slots[c].state, ConnectionState::Idle);
    }

    #[test]
    fn test_lease_ids_are_unique() {
        let mut state: PoolState<()> = PoolState::new();
        state.total = 1;
        let idx = state.insert_slot(cell());
        let first = state.lease_slot(idx).lease_id;
        state.active -= 1;
        state.mark_idle(idx);
        let second = state.lease_slot(idx).lease_id;
        assert_ne!(first, second);
        assert_eq!(state.active, 1);
    }

    #[test]
    fn test_hand_off_skips_cancelled_waiters() {
        let mut state: PoolState<()> = PoolState::new();
        state.total = 1;
        let idx = state.insert_slot(cell());

        let (gone_tx, gone_rx) = oneshot::channel();
        drop(gone_rx);
        let (live_tx, mut live_rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id: 0, tx: gone_tx });
        state.waiters.push_back(Waiter { id: 1, tx: live_tx });

        assert!(state.hand_off_slot(idx));
        assert!(state.waiters.is_empty());
        assert_eq!(state.active, 1);
        assert!(matches!(live_rx.try_recv(), Ok(Grant::Connection(c)) if c.slot == idx));
    }

    #[test]
    fn test_hand_off_capacity_without_waiters() {
        let mut state: PoolState<()> = PoolState::new();
        assert!(!state.hand_off_capacity());
    }

    #[test]
    fn test_status_helpers() {
        let status = PoolStatus {
            total: 4,
            active: 2,
            idle: 2,
            waiting: 0,
            max_connections: 4,
            closed: false,
        };
        assert_eq!(status.utilization(), 0.5);
        assert!(!status.is_at_capacity());
        assert!(
            PoolStatus {
                active: 4,
                idle: 0,
                ..status
            }
            .is_at_capacity()
        );
    }
}
