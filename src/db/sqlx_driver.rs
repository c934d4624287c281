//! [`Driver`] backed by sqlx single connections.
//!
//! The pool in [`super::pool`] owns connection lifecycle, so this driver opens
//! bare `PgConnection`/`SqliteConnection`s rather than sqlx pools.
//!
//! Each backend lives in its own submodule with identical shape:
//! `connect`, `execute` and parameter binding.

use crate::classify::{ErrorClassifier, RawError};
use crate::config::PoolConfig;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, QueryOutput, Statement, Value};
use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use std::time::Instant;
use tracing::{debug, info};

/// Opens sqlx connections for a [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct SqlxDriver {
    config: ConnectionConfig,
}

impl SqlxDriver {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

/// One physical sqlx connection.
#[derive(Debug)]
pub enum SqlxConnection {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

#[async_trait]
impl Driver for SqlxDriver {
    type Connection = SqlxConnection;

    async fn connect(&self) -> Result<SqlxConnection, RawError> {
        let started = Instant::now();
        let conn = match self.config.backend {
            DatabaseType::PostgreSQL => SqlxConnection::Postgres(postgres::connect(&self.config).await?),
            DatabaseType::SQLite => SqlxConnection::Sqlite(sqlite::connect(&self.config).await?),
        };
        debug!(
            database = %self.config.masked_url(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connected"
        );
        Ok(conn)
    }

    fn error_classifier(&self) -> ErrorClassifier {
        match self.config.backend {
            DatabaseType::PostgreSQL => ErrorClassifier::postgres(),
            DatabaseType::SQLite => ErrorClassifier::sqlite(),
        }
    }
}

#[async_trait]
impl DriverConnection for SqlxConnection {
    async fn execute(&mut self, statement: &Statement) -> Result<QueryOutput, RawError> {
        let started = Instant::now();
        let output = match self {
            Self::Postgres(conn) => postgres::execute(conn, statement).await?,
            Self::Sqlite(conn) => sqlite::execute(conn, statement).await?,
        };
        debug!(
            rows = output.rows.len(),
            rows_affected = output.rows_affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statement completed"
        );
        Ok(output)
    }

    async fn close(self) -> Result<(), RawError> {
        match self {
            Self::Postgres(conn) => conn.close().await?,
            Self::Sqlite(conn) => conn.close().await?,
        }
        Ok(())
    }
}

impl Pool<SqlxDriver> {
    /// Create a pool for a connection configuration, using the pool options
    /// it carries.
    pub fn connect_with(config: ConnectionConfig) -> DbResult<Self> {
        let pool_config = config.pool_config();
        Self::connect_with_pool_config(config, pool_config)
    }

    /// Create a pool from a database URL.
    pub fn connect_url(url: &str) -> DbResult<Self> {
        let config = ConnectionConfig::parse(url).map_err(|e| DbError::config(e.to_string()))?;
        Self::connect_with(config)
    }

    pub fn connect_with_pool_config(
        config: ConnectionConfig,
        pool_config: PoolConfig,
    ) -> DbResult<Self> {
        config
            .validate()
            .map_err(|e| DbError::config(e.to_string()))?;
        info!(
            backend = %config.backend,
            database = %config.masked_url(),
            "Creating connection pool"
        );
        Pool::new(SqlxDriver::new(config), pool_config)
    }
}

/// Sum `rows_affected` over every result set and collect all rows.
macro_rules! drain_results {
    ($stream:expr) => {{
        use futures_util::TryStreamExt;
        let mut stream = $stream;
        let mut output = QueryOutput::default();
        while let Some(item) = stream.try_next().await? {
            match item {
                sqlx::Either::Left(done) => output.rows_affected += done.rows_affected(),
                sqlx::Either::Right(row) => output.rows.push(row.to_json_map()),
            }
        }
        output
    }};
}

mod postgres {
    use super::*;
    use crate::db::types::{RowToJson, UntypedNull};
    use sqlx::postgres::{PgArguments, PgConnectOptions, PgSslMode};
    use sqlx::types::Json;
    use sqlx::{Executor, Postgres};

    pub async fn connect(config: &ConnectionConfig) -> Result<PgConnection, RawError> {
        let mut opts = PgConnectOptions::new().database(&config.database);
        if let Some(host) = &config.host {
            opts = opts.host(host);
        }
        if let Some(port) = config.port_or_default() {
            opts = opts.port(port);
        }
        if let Some(user) = &config.user {
            opts = opts.username(user);
        }
        if let Some(password) = &config.password {
            opts = opts.password(password);
        }
        opts = opts.ssl_mode(if config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        });
        Ok(PgConnection::connect_with(&opts).await?)
    }

    pub async fn execute(
        conn: &mut PgConnection,
        statement: &Statement,
    ) -> Result<QueryOutput, RawError> {
        // Without parameters use the simple protocol, which also accepts
        // several statements separated by semicolons.
        if statement.params().is_empty() {
            return Ok(drain_results!(conn.fetch_many(statement.text())));
        }
        let mut query = sqlx::query(statement.text());
        for param in statement.params() {
            query = bind(query, param);
        }
        Ok(drain_results!(conn.fetch_many(query)))
    }

    fn bind<'q>(
        query: sqlx::query::Query<'q, Postgres, PgArguments>,
        param: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, PgArguments> {
        match param {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
            Value::Json(v) => query.bind(Json(v)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::types::RowToJson;
    use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions};
    use sqlx::{Executor, Sqlite};
    use std::str::FromStr;

    pub async fn connect(config: &ConnectionConfig) -> Result<SqliteConnection, RawError> {
        // Every in-memory connection is a separate, empty database.
        let opts = if config.database == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.database)
                .create_if_missing(true)
        };
        Ok(SqliteConnection::connect_with(&opts).await?)
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        statement: &Statement,
    ) -> Result<QueryOutput, RawError> {
        if statement.params().is_empty() {
            return Ok(drain_results!(conn.fetch_many(statement.text())));
        }
        let mut query = sqlx::query(statement.text());
        for param in statement.params() {
            query = bind(query, param);
        }
        Ok(drain_results!(conn.fetch_many(query)))
    }

    fn bind<'q>(
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
        param: &'q Value,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
            // No native JSON type, stored as text
            Value::Json(v) => query.bind(v.to_string()),
        }
    }
}
