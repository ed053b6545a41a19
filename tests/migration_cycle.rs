//! Migration lifecycle against a real SQLite database: apply, reverse,
//! restart integrity, and the reverse safety check.

#![cfg(feature = "sqlite")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "test code can panic"
)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hydrogen::dqm::{Dqm, QueueError, Tier, WorkRequest};
use hydrogen::engine::{Engine, EngineTag, QueryOutcome, Registry};
use hydrogen::migrate::{MigrateError, MigrationSet};
use test_util::{sqlite_file_descriptor, write_basic_migrations, write_single_migration};

fn sqlite_engine() -> Arc<dyn Engine> {
    Registry::global()
        .get(EngineTag::Sqlite)
        .expect("sqlite provider compiled in")
}

async fn launch(db: &Path, migrations: &Path) -> Dqm {
    let descriptor =
        sqlite_file_descriptor("Workshop", db, Some(migrations.to_path_buf()));
    let dqm = Dqm::new(descriptor, sqlite_engine());
    dqm.launch().await.expect("launch");
    dqm
}

async fn applied_ordinals(dqm: &Dqm) -> Vec<i64> {
    let submission = dqm
        .submit(WorkRequest::new(
            0,
            Tier::Fast,
            "SELECT ordinal FROM hydrogen_migrations ORDER BY ordinal",
            Vec::new(),
        ))
        .expect("submit");
    match submission.receiver.await.expect("delivered").expect("ok") {
        QueryOutcome::Rows { rows, .. } => rows
            .iter()
            .filter_map(|row| row.first().and_then(serde_json::Value::as_i64))
            .collect(),
        QueryOutcome::RowCount(_) => Vec::new(),
    }
}

#[tokio::test]
async fn apply_populates_schema_and_queries_table() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    write_basic_migrations(&migrations);
    let db = dir.path().join("workshop.db");

    let dqm = launch(&db, &migrations).await;
    assert_eq!(applied_ordinals(&dqm).await, vec![1, 2]);

    // Query refs defined by the migrations resolve and execute.
    let table = dqm.queries();
    assert!(table.get(101).is_some());
    let insert = table.get(102).expect("insert def").clone();
    let mut params = Vec::new();
    params.push(hydrogen::engine::Param::Text("wrench".to_owned()));
    let mut request = WorkRequest::new(102, insert.tier, insert.sql.clone(), params);
    request.transactional = insert.transactional;
    let outcome = dqm
        .submit(request)
        .expect("submit")
        .receiver
        .await
        .expect("delivered")
        .expect("ok");
    assert_eq!(outcome, QueryOutcome::RowCount(1));

    let lookup = table.get(101).expect("lookup def");
    let outcome = dqm
        .submit(WorkRequest::new(101, lookup.tier, lookup.sql.clone(), Vec::new()))
        .expect("submit")
        .receiver
        .await
        .expect("delivered")
        .expect("ok");
    match outcome {
        QueryOutcome::Rows { columns, rows } => {
            assert_eq!(columns, vec!["id", "name"]);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][1], serde_json::json!("wrench"));
        }
        QueryOutcome::RowCount(_) => panic!("expected rows"),
    }
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn relaunch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    write_basic_migrations(&migrations);
    let db = dir.path().join("workshop.db");

    let first = launch(&db, &migrations).await;
    assert_eq!(applied_ordinals(&first).await, vec![1, 2]);
    first.shutdown(Duration::from_secs(1)).await;

    let second = launch(&db, &migrations).await;
    assert_eq!(applied_ordinals(&second).await, vec![1, 2]);
    second.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn reverse_unwinds_in_descending_order_and_is_then_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    write_basic_migrations(&migrations);
    let db = dir.path().join("workshop.db");

    let dqm = launch(&db, &migrations).await;
    let set = MigrationSet::load(&migrations, EngineTag::Sqlite, "main").expect("load");

    let reversed = set.reverse_all(&dqm).await.expect("reverse");
    assert_eq!(reversed, 2);
    assert_eq!(applied_ordinals(&dqm).await, Vec::<i64>::new());
    // The table itself is gone too.
    let submission = dqm
        .submit(WorkRequest::new(
            0,
            Tier::Fast,
            "SELECT COUNT(*) FROM gadgets",
            Vec::new(),
        ))
        .expect("submit");
    assert!(submission.receiver.await.expect("delivered").is_err());

    // A second reverse phase has nothing to do.
    assert_eq!(set.reverse_all(&dqm).await.expect("reverse again"), 0);
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn reverse_refuses_to_drop_tables_holding_foreign_rows() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    write_basic_migrations(&migrations);
    let db = dir.path().join("workshop.db");

    let dqm = launch(&db, &migrations).await;
    // A user row lands in gadgets outside any migration.
    let outcome = dqm
        .submit(WorkRequest::new(
            0,
            Tier::Medium,
            "INSERT INTO gadgets (name) VALUES ('user data')",
            Vec::new(),
        ))
        .expect("submit")
        .receiver
        .await
        .expect("delivered")
        .expect("ok");
    assert_eq!(outcome, QueryOutcome::RowCount(1));

    let set = MigrationSet::load(&migrations, EngineTag::Sqlite, "main").expect("load");
    let error = set.reverse_all(&dqm).await.expect_err("must refuse");
    assert!(matches!(
        error,
        MigrateError::ReverseUnsafe { ordinal: 1, ref table } if table == "gadgets"
    ));
    // Ordinal 2 was already unwound before the refusal; ordinal 1 stays.
    assert_eq!(applied_ordinals(&dqm).await, vec![1]);
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn edited_applied_migration_is_fatal_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    write_single_migration(&migrations);
    let db = dir.path().join("workshop.db");

    let first = launch(&db, &migrations).await;
    assert_eq!(applied_ordinals(&first).await, vec![1]);
    first.shutdown(Duration::from_secs(1)).await;

    // Rewrite the applied ordinal's content on disk.
    std::fs::write(
        migrations.join("workshop").join("0001_spares.toml"),
        r#"
ordinal = 1
forward = "CREATE TABLE spares (id ${TYPE_PK}, label ${TYPE_TEXT}, edited ${TYPE_INT})"
reverse = "DROP TABLE spares"
"#,
    )
    .unwrap();

    let descriptor = sqlite_file_descriptor("Workshop", &db, Some(migrations.clone()));
    let second = Dqm::new(descriptor, sqlite_engine());
    let error = second.launch().await.expect_err("must refuse to run");
    assert!(matches!(
        error,
        hydrogen::dqm::LaunchError::Migration(MigrateError::HashMismatch { ordinal: 1 })
    ));
    // The manager refuses Running and accepts nothing.
    assert_eq!(second.state(), hydrogen::dqm::DqmState::Launching);
    assert_eq!(
        second
            .submit(WorkRequest::new(0, Tier::Fast, "SELECT 1", Vec::new()))
            .map(|_| ()),
        Err(QueueError::NotRunning)
    );
}
