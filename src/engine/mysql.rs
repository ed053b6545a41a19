//! MySQL/MariaDB engine provider, backed by sqlx.
//!
//! The session `max_execution_time` is installed once at connect time.
//! Transactions open with `START TRANSACTION`; a serializable request sets
//! the next-transaction isolation first. Server-side statement persistence
//! is delegated to the driver's per-connection cache while the statement
//! cache enforces arity, capacity, and LRU bookkeeping.

#![allow(
    clippy::indexing_slicing,
    reason = "row and column indices come from the driver's own metadata"
)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, ConnectOptions, Row, TypeInfo};
use tokio::time::timeout;
use tracing::debug;

use super::sql_util::returns_rows;
use super::{
    EngineConnection, EngineError, EngineTag, ExecTarget, Fingerprint, Isolation, Param,
    PreparedRef, QueryOutcome, StatementCache, StatementId, TxState,
};
use crate::config::Endpoint;

/// Session statement timeout installed at connect time, in milliseconds.
const STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// Provider for the `mysql` engine tag.
pub struct MysqlEngine;

#[async_trait]
impl super::Engine for MysqlEngine {
    fn tag(&self) -> EngineTag {
        EngineTag::Mysql
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn EngineConnection>, EngineError> {
        let mut options = MySqlConnectOptions::new();
        if let Some(host) = &endpoint.host {
            options = options.host(host);
        }
        if let Some(port) = endpoint.port {
            options = options.port(port);
        }
        if let Some(database) = &endpoint.database {
            options = options.database(database);
        }
        if let Some(username) = &endpoint.username {
            options = options.username(username);
        }
        if let Some(password) = &endpoint.password {
            options = options.password(password);
        }
        let mut conn = options
            .connect()
            .await
            .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;
        sqlx::query(&format!(
            "SET SESSION max_execution_time = {STATEMENT_TIMEOUT_MS}"
        ))
        .execute(&mut conn)
        .await
        .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;
        debug!(host = endpoint.host.as_deref(), "mysql session opened");
        Ok(Box::new(MysqlSession {
            conn: Some(conn),
            cache: StatementCache::default(),
            statements: HashMap::new(),
            next_statement: 0,
            tx: None,
            next_tx: 0,
        }))
    }
}

struct MysqlSession {
    conn: Option<sqlx::mysql::MySqlConnection>,
    cache: StatementCache,
    statements: HashMap<StatementId, String>,
    next_statement: u64,
    tx: Option<TxState>,
    next_tx: u64,
}

impl MysqlSession {
    fn live(&mut self) -> Result<&mut sqlx::mysql::MySqlConnection, EngineError> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::ConnLost("mysql session is closed".to_owned()))
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
impl EngineConnection for MysqlSession {
    fn tag(&self) -> EngineTag {
        EngineTag::Mysql
    }

    fn tx_state(&self) -> Option<TxState> {
        self.tx
    }

    async fn begin(&mut self, isolation: Isolation) -> Result<(), EngineError> {
        if self.tx.is_some() {
            return Err(EngineError::TxInProgress);
        }
        if isolation == Isolation::Serializable {
            self.run_simple("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .await?;
        }
        self.run_simple("START TRANSACTION").await?;
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
        timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        let millis = timeout.map_or(0, |budget| budget.as_millis());
        self.run_simple(&format!("SET SESSION max_execution_time = {millis}"))
            .await
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
                debug!(%error, "mysql close reported an error");
            }
        }
        self.tx = None;
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    params: &'q [Param],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
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

fn rows_to_outcome(rows: &[MySqlRow]) -> QueryOutcome {
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

fn decode_value(row: &MySqlRow, index: usize) -> serde_json::Value {
    use serde_json::Value;
    let type_name = row.columns()[index].type_info().name().to_ascii_uppercase();
    if type_name == "BOOLEAN" {
        if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
            return value.map_or(Value::Null, Value::from);
        }
    }
    if type_name.contains("INT") {
        if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
            return value.map_or(Value::Null, Value::from);
        }
        if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
            return value.map_or(Value::Null, Value::from);
        }
    }
    if type_name.contains("FLOAT") || type_name.contains("DOUBLE") {
        if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
            return value.map_or(Value::Null, Value::from);
        }
    }
    if type_name.contains("DATETIME") || type_name.contains("TIMESTAMP") {
        if let Ok(value) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
            return value.map_or(Value::Null, |t| Value::from(t.to_string()));
        }
    }
    if type_name == "DATE" {
        if let Ok(value) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
            return value.map_or(Value::Null, |d| Value::from(d.to_string()));
        }
    }
    row.try_get::<Option<String>, _>(index)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from)
}

fn classify(error: sqlx::Error) -> EngineError {
    match error {
        sqlx::Error::Io(e) => EngineError::ConnLost(e.to_string()),
        sqlx::Error::Protocol(msg) => EngineError::ConnLost(msg),
        sqlx::Error::Database(db) => {
            let message = db.message().to_owned();
            if message.contains("Deadlock found")
                || db.code().as_deref() == Some("40001")
            {
                EngineError::Conflict(message)
            } else if message.contains("max_execution_time exceeded")
                || message.contains("Lock wait timeout")
            {
                EngineError::Timeout
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
