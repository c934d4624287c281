//! db-client-core - run statements and SQL files through the pool.
//!
//! Each `-e` statement runs on its own pooled connection and prints its rows
//! as JSON. Each file runs inside a single transaction that is rolled back
//! if any part of it fails.

use db_client_core::config::Config;
use db_client_core::db::{Lease, Pool, SqlxDriver};
use db_client_core::error::DbResult;
use db_client_core::models::{DatabaseType, Statement};
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run_statement(
    pool: &Pool<SqlxDriver>,
    sql: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = pool.query(&Statement::raw(sql)).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn apply_in_transaction(lease: &Lease<SqlxDriver>, sql: String) -> DbResult<u64> {
    let mut tx = lease.begin().await?;
    match tx.execute(&Statement::raw(sql)).await {
        Ok(output) => {
            tx.commit().await?;
            Ok(output.rows_affected)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

async fn apply_file(
    pool: &Pool<SqlxDriver>,
    path: &Path,
) -> Result<u64, Box<dyn std::error::Error>> {
    let sql = std::fs::read_to_string(path)?;
    let lease = pool.checkout().await?;
    let result = apply_in_transaction(&lease, sql).await;
    lease.release()?;
    Ok(result?)
}

async fn run(config: &Config, pool: &Pool<SqlxDriver>) -> Result<(), Box<dyn std::error::Error>> {
    for sql in &config.execute {
        run_statement(pool, sql).await?;
    }
    for path in &config.files {
        match apply_file(pool, path).await {
            Ok(rows_affected) => {
                info!(file = %path.display(), rows_affected, "Applied file");
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "File rolled back");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    let conn_config = config.connection_config()?;
    if conn_config.backend == DatabaseType::SQLite
        && conn_config.database == ":memory:"
        && conn_config.max_connections > 1
    {
        warn!("Each in-memory SQLite connection is a separate database; consider max_connections=1");
    }

    info!(
        database = %conn_config.masked_url(),
        max_connections = conn_config.max_connections,
        "Starting db-client-core v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = Pool::connect_with(conn_config)?;

    let result = tokio::select! {
        result = run(&config, &pool) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Ok(())
        }
    };

    let report = pool.shutdown(config.shutdown_grace_duration()).await;
    info!(
        idle_closed = report.idle_closed,
        drained = report.drained,
        force_closed = report.force_closed,
        "Shutdown complete"
    );

    result
}
