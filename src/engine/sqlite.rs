//! SQLite engine provider, backed by sqlx.
//!
//! SQLite runs in-process, so `connect` opens (and optionally creates) the
//! database file named by the endpoint; `:memory:` endpoints get a private
//! in-memory database. Transactions use `BEGIN DEFERRED`. There is no
//! server-side statement timeout; the busy timeout is installed at connect
//! time and per-statement deadlines are enforced by the execution wrapper.

#![allow(
    clippy::indexing_slicing,
    reason = "row and column indices come from the driver's own metadata"
)]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, ConnectOptions, Row, TypeInfo};
use tokio::time::timeout;
use tracing::debug;

use super::sql_util::returns_rows;
use super::{
    EngineConnection, EngineError, EngineTag, ExecTarget, Fingerprint, Isolation, Param,
    PreparedRef, QueryOutcome, StatementCache, StatementId, TxState,
};
use crate::config::Endpoint;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider for the `sqlite` engine tag.
pub struct SqliteEngine;

#[async_trait]
impl super::Engine for SqliteEngine {
    fn tag(&self) -> EngineTag {
        EngineTag::Sqlite
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn EngineConnection>, EngineError> {
        let path = endpoint
            .database
            .as_deref()
            .ok_or_else(|| EngineError::ConnectFailed("sqlite endpoint has no path".to_owned()))?;
        let options = SqliteConnectOptions::new()
            .filename(Path::new(path))
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let conn = options
            .connect()
            .await
            .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;
        debug!(path, "sqlite session opened");
        Ok(Box::new(SqliteSession {
            conn: Some(conn),
            cache: StatementCache::default(),
            statements: HashMap::new(),
            next_statement: 0,
            tx: None,
            next_tx: 0,
        }))
    }
}

struct SqliteSession {
    conn: Option<sqlx::sqlite::SqliteConnection>,
    cache: StatementCache,
    statements: HashMap<StatementId, String>,
    next_statement: u64,
    tx: Option<TxState>,
    next_tx: u64,
}

impl SqliteSession {
    fn live(&mut self) -> Result<&mut sqlx::sqlite::SqliteConnection, EngineError> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::ConnLost("sqlite session is closed".to_owned()))
    }

    async fn run_simple(&mut self, sql: &str) -> Result<(), EngineError> {
        let conn = self.live()?;
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[async_trait]
impl EngineConnection for SqliteSession {
    fn tag(&self) -> EngineTag {
        EngineTag::Sqlite
    }

    fn tx_state(&self) -> Option<TxState> {
        self.tx
    }

    async fn begin(&mut self, isolation: Isolation) -> Result<(), EngineError> {
        if self.tx.is_some() {
            return Err(EngineError::TxInProgress);
        }
        self.run_simple("BEGIN DEFERRED").await?;
        self.next_tx += 1;
        self.tx = Some(TxState {
            id: self.next_tx,
            isolation,
            depth: 1,
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        if self.tx.is_none() {
            return Err(EngineError::NoTx);
        }
        let result = self.run_simple("COMMIT").await;
        self.tx = None;
        result
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        if self.tx.is_none() {
            return Err(EngineError::NoTx);
        }
        // The transaction is finalised no matter what the backend says.
        let result = self.run_simple("ROLLBACK").await;
        self.tx = None;
        match result {
            Err(EngineError::Conflict(msg)) => Err(EngineError::ExecFailed(msg)),
            other => other,
        }
    }

    async fn prepare(
        &mut self,
        fingerprint: &Fingerprint,
        sql: &str,
        arity: usize,
    ) -> Result<PreparedRef, EngineError> {
        if let Some((id, cached_arity)) = self.cache.lookup(fingerprint, sql) {
            self.cache.touch(fingerprint);
            return Ok(PreparedRef {
                id,
                arity: cached_arity,
            });
        }
        {
            let conn = self.live()?;
            // Round-trip through the driver so a malformed statement fails
            // here rather than at first execution.
            sqlx::Executor::prepare(&mut *conn, sql)
                .await
                .map_err(classify_prepare)?;
        }
        self.next_statement += 1;
        let id = StatementId(self.next_statement);
        self.statements.insert(id, sql.to_owned());
        if let Some(evicted) = self.cache.insert(fingerprint.clone(), id, arity, sql) {
            self.statements.remove(&evicted);
        }
        Ok(PreparedRef { id, arity })
    }

    async fn execute(
        &mut self,
        target: ExecTarget<'_>,
        params: &[Param],
        deadline: Option<Duration>,
    ) -> Result<QueryOutcome, EngineError> {
        let (sql, persistent) = match target {
            ExecTarget::Prepared(prepared) => (
                self.statements
                    .get(&prepared.id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::PrepareFailed("statement is no longer cached".to_owned())
                    })?,
                true,
            ),
            ExecTarget::Sql(text) => (text.to_owned(), false),
        };
        let wants_rows = returns_rows(&sql);
        let conn = self.live()?;
        let run = async {
            if wants_rows {
                let rows = bind_params(sqlx::query(&sql).persistent(persistent), params)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows_to_outcome(&rows))
            } else {
                let result = bind_params(sqlx::query(&sql).persistent(persistent), params)
                    .execute(&mut *conn)
                    .await?;
                Ok(QueryOutcome::RowCount(result.rows_affected()))
            }
        };
        let outcome: Result<QueryOutcome, sqlx::Error> = match deadline {
            Some(budget) => timeout(budget, run)
                .await
                .map_err(|_| EngineError::Timeout)?,
            None => run.await,
        };
        outcome.map_err(classify)
    }

    async fn set_statement_timeout(
        &mut self,
        _timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        // SQLite has no server-side statement timeout; deadlines are
        // enforced around execution and the busy timeout is fixed at
        // connect time.
        self.live().map(|_| ())
    }

    async fn deallocate_all(&mut self) -> Result<(), EngineError> {
        for id in self.cache.clear() {
            self.statements.remove(&id);
        }
        let conn = self.live()?;
        sqlx::Connection::clear_cached_statements(conn)
            .await
            .map_err(classify)
    }

    async fn close(&mut self) {
        let _ = self.deallocate_all().await;
        if let Some(conn) = self.conn.take() {
            if let Err(error) = sqlx::Connection::close(conn).await {
                debug!(%error, "sqlite close reported an error");
            }
        }
        self.tx = None;
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [Param],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Param::Null => query.bind(None::<i64>),
            Param::Bool(value) => query.bind(*value),
            Param::Int(value) => query.bind(*value),
            Param::Float(value) => query.bind(*value),
            Param::Text(value) => query.bind(value.as_str()),
        };
    }
    query
}

fn rows_to_outcome(rows: &[SqliteRow]) -> QueryOutcome {
    let columns = rows.first().map_or_else(Vec::new, |row| {
        row.columns().iter().map(|c| c.name().to_owned()).collect()
    });
    let data = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|i| decode_value(row, i))
                .collect()
        })
        .collect();
    QueryOutcome::Rows {
        columns,
        rows: data,
    }
}

/// SQLite values are dynamically typed; decode by the value's reported
/// type with a text fallback.
fn decode_value(row: &SqliteRow, index: usize) -> serde_json::Value {
    let type_name = row.columns()[index].type_info().name().to_ascii_uppercase();
    match type_name.as_str() {
        "INTEGER" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map_or(serde_json::Value::Null, Into::into),
        "REAL" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map_or(serde_json::Value::Null, Into::into),
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map_or(serde_json::Value::Null, Into::into),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map_or(serde_json::Value::Null, Into::into),
    }
}

fn classify(error: sqlx::Error) -> EngineError {
    match error {
        sqlx::Error::Io(e) => EngineError::ConnLost(e.to_string()),
        sqlx::Error::Protocol(msg) => EngineError::ConnLost(msg),
        sqlx::Error::Database(db) => {
            let message = db.message().to_owned();
            if message.contains("database is locked") || message.contains("database table is locked")
            {
                EngineError::Conflict(message)
            } else {
                EngineError::ExecFailed(message)
            }
        }
        other => EngineError::ExecFailed(other.to_string()),
    }
}

fn classify_prepare(error: sqlx::Error) -> EngineError {
    match error {
        sqlx::Error::Io(e) => EngineError::ConnLost(e.to_string()),
        sqlx::Error::Protocol(msg) => EngineError::ConnLost(msg),
        other => EngineError::PrepareFailed(other.to_string()),
    }
}
