//! Scripted in-memory driver for pool and transaction tests.
//!
//! Every connection records the statements it runs. Statements containing a
//! configured marker can be made to fail (optionally as a lost connection) or
//! to take a while, so tests can drive the pool through its edge cases
//! without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use db_client_core::classify::{ErrorClassifier, RawError};
use db_client_core::config::PoolConfig;
use db_client_core::db::{Driver, DriverConnection, Pool};
use db_client_core::models::{QueryOutput, Statement};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct Failure {
    marker: String,
    code: Option<String>,
    message: String,
    connection_lost: bool,
}

#[derive(Default)]
pub struct MockState {
    next_id: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    executed: Mutex<Vec<(usize, String)>>,
    failures: Mutex<Vec<Failure>>,
    delays: Mutex<Vec<(String, Duration)>>,
}

#[derive(Clone, Default)]
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail statements containing `marker` with a backend error code.
    pub fn fail_on(&self, marker: &str, code: &str, message: &str) {
        self.state.failures.lock().unwrap().push(Failure {
            marker: marker.to_string(),
            code: Some(code.to_string()),
            message: message.to_string(),
            connection_lost: false,
        });
    }

    /// Fail statements containing `marker` as if the socket dropped.
    pub fn drop_connection_on(&self, marker: &str) {
        self.state.failures.lock().unwrap().push(Failure {
            marker: marker.to_string(),
            code: None,
            message: "connection reset by peer".to_string(),
            connection_lost: true,
        });
    }

    /// Make statements containing `marker` take `delay`.
    pub fn delay_on(&self, marker: &str, delay: Duration) {
        self.state
            .delays
            .lock()
            .unwrap()
            .push((marker.to_string(), delay));
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Statements run so far, in order, across all connections.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Statements run on one connection.
    pub fn executed_on(&self, conn_id: usize) -> Vec<String> {
        self.state
            .executed
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == conn_id)
            .map(|(_, sql)| sql.clone())
            .collect()
    }
}

pub struct MockConnection {
    id: usize,
    state: Arc<MockState>,
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, RawError> {
        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(RawError::connection_lost("connection refused"));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }

    fn error_classifier(&self) -> ErrorClassifier {
        ErrorClassifier::postgres()
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<QueryOutput, RawError> {
        let sql = statement.text().to_string();
        self.state
            .executed
            .lock()
            .unwrap()
            .push((self.id, sql.clone()));

        let delay = self
            .state
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, _)| sql.contains(marker.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .state
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|f| sql.contains(f.marker.as_str()))
            .cloned();
        if let Some(f) = failure {
            let mut raw = RawError::new(f.message);
            raw.code = f.code;
            raw.connection_lost = f.connection_lost;
            return Err(raw);
        }

        let mut output = QueryOutput::affected(1);
        let mut row = serde_json::Map::new();
        row.insert("conn".to_string(), json!(self.id));
        output.rows.push(row);
        Ok(output)
    }

    async fn close(self) -> Result<(), RawError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connection id that served a statement.
pub fn conn_id(output: &QueryOutput) -> usize {
    output
        .scalar("conn")
        .and_then(|v| v.as_u64())
        .expect("mock row carries the connection id") as usize
}

/// Pool config without idle reaping or checkout timeout.
pub fn pool_config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        idle_timeout: None,
        connection_timeout: None,
        ..PoolConfig::default()
    }
}

pub fn mock_pool(max_connections: usize) -> (Pool<MockDriver>, MockDriver) {
    let driver = MockDriver::new();
    let pool = Pool::new(driver.clone(), pool_config(max_connections)).unwrap();
    (pool, driver)
}

/// Let spawned tasks (background closes, queued checkouts) make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
