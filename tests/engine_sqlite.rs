//! SQLite provider conformance: transaction state machine, prepared
//! statement identity, and row decoding.

#![cfg(feature = "sqlite")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "test code can panic"
)]

use hydrogen::config::Endpoint;
use hydrogen::engine::{
    fingerprint, Engine, EngineError, EngineTag, ExecTarget, Isolation, Param, QueryOutcome,
    Registry,
};

fn memory_endpoint() -> Endpoint {
    Endpoint {
        database: Some(":memory:".to_owned()),
        ..Endpoint::default()
    }
}

async fn connect() -> Box<dyn hydrogen::engine::EngineConnection> {
    Registry::global()
        .get(EngineTag::Sqlite)
        .expect("sqlite provider compiled in")
        .connect(&memory_endpoint())
        .await
        .expect("connect")
}

#[tokio::test]
async fn begin_rollback_leaves_the_connection_idle() {
    let mut conn = connect().await;
    conn.execute(ExecTarget::Sql("CREATE TABLE t (x INTEGER)"), &[], None)
        .await
        .expect("create");

    assert!(conn.tx_state().is_none());
    conn.begin(Isolation::ReadCommitted).await.expect("begin");
    assert!(conn.tx_state().is_some());
    conn.execute(ExecTarget::Sql("INSERT INTO t VALUES (1)"), &[], None)
        .await
        .expect("insert");
    conn.rollback().await.expect("rollback");
    assert!(conn.tx_state().is_none());

    // No visible side effects survive the rollback.
    let outcome = conn
        .execute(ExecTarget::Sql("SELECT COUNT(*) AS n FROM t"), &[], None)
        .await
        .expect("count");
    match outcome {
        QueryOutcome::Rows { rows, .. } => assert_eq!(rows[0][0], serde_json::json!(0)),
        QueryOutcome::RowCount(_) => panic!("expected rows"),
    }
    conn.close().await;
}

#[tokio::test]
async fn transaction_state_machine_is_enforced() {
    let mut conn = connect().await;
    assert_eq!(conn.commit().await, Err(EngineError::NoTx));
    assert_eq!(conn.rollback().await, Err(EngineError::NoTx));
    conn.begin(Isolation::ReadCommitted).await.expect("begin");
    assert_eq!(
        conn.begin(Isolation::ReadCommitted).await,
        Err(EngineError::TxInProgress)
    );
    conn.commit().await.expect("commit");
    assert_eq!(conn.commit().await, Err(EngineError::NoTx));
    conn.close().await;
}

#[tokio::test]
async fn repeated_prepare_returns_the_same_handle() {
    let mut conn = connect().await;
    conn.execute(ExecTarget::Sql("CREATE TABLE t (x INTEGER)"), &[], None)
        .await
        .expect("create");
    let sql = "SELECT x FROM t WHERE x = ?";
    let print = fingerprint(sql);
    let first = conn.prepare(&print, sql, 1).await.expect("prepare");
    let second = conn.prepare(&print, sql, 1).await.expect("prepare again");
    assert_eq!(first, second);

    // Teardown releases the cached statement; a fresh prepare allocates a
    // new server-side handle.
    conn.deallocate_all().await.expect("deallocate");
    let third = conn.prepare(&print, sql, 1).await.expect("prepare fresh");
    assert_ne!(first.id, third.id);
    conn.close().await;
}

#[tokio::test]
async fn parameters_bind_and_rows_decode() {
    let mut conn = connect().await;
    conn.execute(
        ExecTarget::Sql("CREATE TABLE readings (id INTEGER PRIMARY KEY, label TEXT, value REAL)"),
        &[],
        None,
    )
    .await
    .expect("create");

    let insert = "INSERT INTO readings (label, value) VALUES (?, ?)";
    let print = fingerprint(insert);
    let prepared = conn.prepare(&print, insert, 2).await.expect("prepare");
    let outcome = conn
        .execute(
            ExecTarget::Prepared(prepared),
            &[Param::Text("nozzle".to_owned()), Param::Float(214.5)],
            None,
        )
        .await
        .expect("insert");
    assert_eq!(outcome, QueryOutcome::RowCount(1));

    let outcome = conn
        .execute(
            ExecTarget::Sql("SELECT id, label, value FROM readings"),
            &[],
            None,
        )
        .await
        .expect("select");
    match outcome {
        QueryOutcome::Rows { columns, rows } => {
            assert_eq!(columns, vec!["id", "label", "value"]);
            assert_eq!(rows[0][0], serde_json::json!(1));
            assert_eq!(rows[0][1], serde_json::json!("nozzle"));
            assert_eq!(rows[0][2], serde_json::json!(214.5));
        }
        QueryOutcome::RowCount(_) => panic!("expected rows"),
    }

    // NULL round-trips as JSON null.
    conn.execute(
        ExecTarget::Sql("INSERT INTO readings (label, value) VALUES (?, ?)"),
        &[Param::Null, Param::Null],
        None,
    )
    .await
    .expect("insert nulls");
    let outcome = conn
        .execute(
            ExecTarget::Sql("SELECT label, value FROM readings WHERE id = 2"),
            &[],
            None,
        )
        .await
        .expect("select nulls");
    match outcome {
        QueryOutcome::Rows { rows, .. } => {
            assert_eq!(rows[0][0], serde_json::Value::Null);
            assert_eq!(rows[0][1], serde_json::Value::Null);
        }
        QueryOutcome::RowCount(_) => panic!("expected rows"),
    }
    conn.close().await;
}

#[tokio::test]
async fn malformed_sql_fails_at_prepare() {
    let mut conn = connect().await;
    let sql = "SELEKT broken";
    let print = fingerprint(sql);
    let error = conn.prepare(&print, sql, 0).await.expect_err("must fail");
    assert!(matches!(error, EngineError::PrepareFailed(_)));
    conn.close().await;
}
