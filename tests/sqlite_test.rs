//! End-to-end tests against real SQLite database files.
//!
//! Tests verify that:
//! - A failed transfer rolls back both sides
//! - Committed transactions are visible to other connections
//! - SQLite failures are classified into stable kinds
//! - Builder statements bind correctly against a real backend

use db_client_core::classify::BackendErrorKind;
use db_client_core::db::{Pool, SqlxDriver, TransactionState};
use db_client_core::models::{ConnectionConfig, Statement, Value};
use db_client_core::query::{Direction, QueryBuilder};
use serde_json::json;
use tempfile::TempDir;

/// Create a pool over a fresh database file seeded with two accounts.
async fn setup_db() -> (Pool<SqlxDriver>, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bank.db");
    let url = format!("sqlite:{}?max_connections=2", path.display());
    let pool = Pool::connect_url(&url).unwrap();

    pool.query(&Statement::raw(
        "CREATE TABLE accounts (
            id INTEGER PRIMARY KEY,
            owner TEXT NOT NULL,
            balance INTEGER NOT NULL
        )",
    ))
    .await
    .unwrap();
    pool.query(&Statement::raw(
        "INSERT INTO accounts (id, owner, balance) VALUES (1, 'alice', 100), (2, 'bob', 50)",
    ))
    .await
    .unwrap();

    (pool, dir)
}

async fn balance(pool: &Pool<SqlxDriver>, id: i64) -> i64 {
    let stmt = QueryBuilder::table("accounts")
        .select(["balance"])
        .and_where("id", "=", id)
        .compile()
        .unwrap();
    let out = pool.query(&stmt).await.unwrap();
    out.scalar("balance").and_then(|v| v.as_i64()).unwrap()
}

#[tokio::test]
async fn test_failed_transfer_rolls_back() {
    let (pool, _dir) = setup_db().await;
    let lease = pool.checkout().await.unwrap();
    let mut tx = lease.begin().await.unwrap();

    let debit = tx
        .execute(&Statement::new(
            "UPDATE accounts SET balance = balance - $1 WHERE id = $2",
            vec![Value::Int(30), Value::Int(1)],
        ))
        .await
        .unwrap();
    assert_eq!(debit.rows_affected, 1);

    let err = tx
        .execute(&Statement::new(
            "UPDATE accounts SET balance = $1 WHERE id = $2",
            vec![Value::Null, Value::Int(2)],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.backend_kind(), Some(BackendErrorKind::NotNullViolation));
    assert_eq!(tx.state(), TransactionState::Failed);

    tx.rollback().await.unwrap();
    drop(tx);
    lease.release().unwrap();

    assert_eq!(balance(&pool, 1).await, 100);
    assert_eq!(balance(&pool, 2).await, 50);
    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_committed_transfer_is_visible() {
    let (pool, _dir) = setup_db().await;
    let lease = pool.checkout().await.unwrap();
    let mut tx = lease.begin().await.unwrap();

    for (amount, id) in [(-30, 1), (30, 2)] {
        tx.execute(&Statement::new(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2",
            vec![Value::Int(amount), Value::Int(id)],
        ))
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
    drop(tx);
    lease.release().unwrap();

    assert_eq!(balance(&pool, 1).await, 70);
    assert_eq!(balance(&pool, 2).await, 80);
    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_sqlite_errors_are_classified() {
    let (pool, _dir) = setup_db().await;

    let err = pool
        .query(&Statement::raw(
            "INSERT INTO accounts (id, owner, balance) VALUES (1, 'mallory', 0)",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.backend_kind(), Some(BackendErrorKind::UniqueViolation));

    let err = pool
        .query(&Statement::raw("SELECT * FROM ledger"))
        .await
        .unwrap_err();
    assert_eq!(err.backend_kind(), Some(BackendErrorKind::UndefinedTable));

    let err = pool
        .query(&Statement::raw("SELECT nickname FROM accounts"))
        .await
        .unwrap_err();
    assert_eq!(err.backend_kind(), Some(BackendErrorKind::UndefinedColumn));

    // Failures never leak leases
    assert_eq!(pool.status().active, 0);
    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_builder_statements_against_sqlite() {
    let (pool, _dir) = setup_db().await;
    pool.query(&Statement::raw(
        "INSERT INTO accounts (id, owner, balance) VALUES (3, 'carol', 75)",
    ))
    .await
    .unwrap();

    let stmt = QueryBuilder::table("accounts")
        .select(["id", "owner"])
        .and_where("balance", ">=", 60)
        .order_by("balance", Direction::Desc)
        .limit(10)
        .compile()
        .unwrap();
    let out = pool.query(&stmt).await.unwrap();
    let owners: Vec<_> = out.rows.iter().map(|r| r["owner"].clone()).collect();
    assert_eq!(owners, vec![json!("alice"), json!("carol")]);

    let stmt = QueryBuilder::table("accounts")
        .and_where_in("id", [2i64, 3])
        .order_by("id", Direction::Asc)
        .compile()
        .unwrap();
    let out = pool.query(&stmt).await.unwrap();
    assert_eq!(out.rows.len(), 2);
    assert_eq!(out.rows[0]["owner"], json!("bob"));

    let stmt = QueryBuilder::table("accounts")
        .and_where_in("id", Vec::<i64>::new())
        .compile()
        .unwrap();
    assert!(pool.query(&stmt).await.unwrap().rows.is_empty());

    // Hostile input stays a bound value
    let stmt = QueryBuilder::table("accounts")
        .and_where("owner", "=", "alice' OR '1'='1")
        .compile()
        .unwrap();
    assert!(pool.query(&stmt).await.unwrap().rows.is_empty());
    assert_eq!(balance(&pool, 1).await, 100);

    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_in_memory_database() {
    let pool = Pool::connect_with(ConnectionConfig {
        max_connections: 1,
        ..ConnectionConfig::sqlite(":memory:")
    })
    .unwrap();

    let lease = pool.checkout().await.unwrap();
    lease
        .execute(&Statement::raw("CREATE TABLE t (v TEXT)"))
        .await
        .unwrap();
    lease
        .execute(&Statement::new(
            "INSERT INTO t (v) VALUES ($1)",
            vec![Value::from("x")],
        ))
        .await
        .unwrap();
    let out = lease
        .execute(&Statement::raw("SELECT COUNT(*) AS n FROM t"))
        .await
        .unwrap();
    assert_eq!(out.scalar("n"), Some(&json!(1)));
    lease.release().unwrap();

    let report = pool.shutdown(std::time::Duration::from_secs(1)).await;
    assert_eq!(report.idle_closed, 1);
}
