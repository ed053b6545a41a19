//! PostgreSQL engine provider, backed by tokio-postgres.
//!
//! The per-connection statement timeout is installed once at connect time;
//! no operation re-sets it per call. Transactions open with a plain `BEGIN`,
//! leaving isolation to the connection-level default. Prepared statements
//! are real server-side statements whose handles live in the statement
//! cache; disconnect releases them with a single batched `DEALLOCATE ALL`.

#![allow(
    clippy::indexing_slicing,
    reason = "row and column indices come from the driver's own metadata"
)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::{debug, warn};

use super::sql_util::{number_placeholders, returns_rows};
use super::{
    EngineConnection, EngineError, EngineTag, ExecTarget, Fingerprint, Isolation, Param,
    PreparedRef, QueryOutcome, StatementCache, StatementId, TxState,
};
use crate::config::Endpoint;

/// Session statement timeout installed at connect time.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider for the `postgres` engine tag.
pub struct PostgresEngine;

#[async_trait]
impl super::Engine for PostgresEngine {
    fn tag(&self) -> EngineTag {
        EngineTag::Postgres
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn EngineConnection>, EngineError> {
        let mut config = tokio_postgres::Config::new();
        if let Some(host) = &endpoint.host {
            config.host(host);
        }
        if let Some(port) = endpoint.port {
            config.port(port);
        }
        if let Some(database) = &endpoint.database {
            config.dbname(database);
        }
        if let Some(username) = &endpoint.username {
            config.user(username);
        }
        if let Some(password) = &endpoint.password {
            config.password(password);
        }
        config.connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;
        let driver = tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(%error, "postgres connection driver finished with error");
            }
        });
        client
            .batch_execute(&format!(
                "SET statement_timeout = {}",
                STATEMENT_TIMEOUT.as_millis()
            ))
            .await
            .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;
        Ok(Box::new(PostgresSession {
            client: Some(client),
            driver,
            cache: StatementCache::default(),
            statements: HashMap::new(),
            next_statement: 0,
            tx: None,
            next_tx: 0,
        }))
    }
}

struct PreparedEntry {
    statement: Statement,
    wants_rows: bool,
}

struct PostgresSession {
    client: Option<Client>,
    driver: JoinHandle<()>,
    cache: StatementCache,
    statements: HashMap<StatementId, PreparedEntry>,
    next_statement: u64,
    tx: Option<TxState>,
    next_tx: u64,
}

impl PostgresSession {
    fn live(&mut self) -> Result<&Client, EngineError> {
        let alive = self.client.as_ref().is_some_and(|c| !c.is_closed());
        if !alive {
            // The backend went away underneath us.
            self.client = None;
            self.tx = None;
        }
        self.client
            .as_ref()
            .ok_or_else(|| EngineError::ConnLost("postgres session is closed".to_owned()))
    }

    async fn run_simple(&mut self, sql: &str) -> Result<(), EngineError> {
        let client = self.live()?;
        client.batch_execute(sql).await.map_err(classify)
    }
}

#[async_trait]
impl EngineConnection for PostgresSession {
    fn tag(&self) -> EngineTag {
        EngineTag::Postgres
    }

    fn tx_state(&self) -> Option<TxState> {
        self.tx
    }

    async fn begin(&mut self, isolation: Isolation) -> Result<(), EngineError> {
        if self.tx.is_some() {
            return Err(EngineError::TxInProgress);
        }
        // Plain BEGIN; isolation stays at the connection-level default.
        self.run_simple("BEGIN").await?;
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
        let numbered = if arity > 0 && sql.contains('?') {
            number_placeholders(sql)
        } else {
            sql.to_owned()
        };
        let statement = {
            let client = self.live()?;
            client.prepare(&numbered).await.map_err(classify_prepare)?
        };
        if statement.params().len() != arity {
            return Err(EngineError::PrepareFailed(format!(
                "statement binds {} parameters, declared {arity}",
                statement.params().len()
            )));
        }
        self.next_statement += 1;
        let id = StatementId(self.next_statement);
        self.statements.insert(
            id,
            PreparedEntry {
                statement,
                wants_rows: returns_rows(sql),
            },
        );
        if let Some(evicted) = self.cache.insert(fingerprint.clone(), id, arity, sql) {
            // Dropping the handle sends the single-statement close for the
            // evicted entry.
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
        enum Runnable {
            Stmt(Statement, bool),
            Raw(String, bool),
        }
        let runnable = match target {
            ExecTarget::Prepared(prepared) => {
                let entry = self.statements.get(&prepared.id).ok_or_else(|| {
                    EngineError::PrepareFailed("statement is no longer cached".to_owned())
                })?;
                Runnable::Stmt(entry.statement.clone(), entry.wants_rows)
            }
            ExecTarget::Sql(text) => {
                let rewritten = if params.is_empty() || !text.contains('?') {
                    text.to_owned()
                } else {
                    number_placeholders(text)
                };
                Runnable::Raw(rewritten, returns_rows(text))
            }
        };
        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let client = self.live()?;
        let run = async {
            match &runnable {
                Runnable::Stmt(stmt, true) => {
                    client.query(stmt, &bound).await.map(|rows| rows_to_outcome(&rows))
                }
                Runnable::Stmt(stmt, false) => {
                    client.execute(stmt, &bound).await.map(QueryOutcome::RowCount)
                }
                Runnable::Raw(sql, true) => client
                    .query(sql.as_str(), &bound)
                    .await
                    .map(|rows| rows_to_outcome(&rows)),
                Runnable::Raw(sql, false) => client
                    .execute(sql.as_str(), &bound)
                    .await
                    .map(QueryOutcome::RowCount),
            }
        };
        let outcome = match deadline {
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
        let sql = match timeout {
            Some(budget) => format!("SET statement_timeout = {}", budget.as_millis()),
            None => "SET statement_timeout = 0".to_owned(),
        };
        self.run_simple(&sql).await
    }

    async fn deallocate_all(&mut self) -> Result<(), EngineError> {
        self.cache.clear();
        self.statements.clear();
        self.run_simple("DEALLOCATE ALL").await
    }

    async fn close(&mut self) {
        if self.client.is_some() {
            if let Err(error) = self.deallocate_all().await {
                debug!(%error, "postgres deallocate on close failed");
            }
        }
        self.client = None;
        self.statements.clear();
        self.tx = None;
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl ToSql for Param {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(value) => value.to_sql(ty, out),
            Self::Int(value) => {
                if *ty == Type::INT2 {
                    i16::try_from(*value)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*value)?.to_sql(ty, out)
                } else if *ty == Type::OID {
                    u32::try_from(*value)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
                    #[allow(clippy::cast_precision_loss, reason = "explicit float binding")]
                    let as_float = *value as f64;
                    as_float.to_sql(ty, out)
                } else {
                    value.to_sql(ty, out)
                }
            }
            Self::Float(value) => {
                if *ty == Type::FLOAT4 {
                    #[allow(clippy::cast_possible_truncation, reason = "explicit float4 binding")]
                    let narrowed = *value as f32;
                    narrowed.to_sql(ty, out)
                } else {
                    value.to_sql(ty, out)
                }
            }
            Self::Text(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn rows_to_outcome(rows: &[Row]) -> QueryOutcome {
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

fn decode_value(row: &Row, index: usize) -> serde_json::Value {
    use serde_json::Value;
    let ty = row.columns()[index].type_();
    let decoded: Option<Value> = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(index).ok().flatten().map(Value::from)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(index).ok().flatten().map(Value::from)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(index).ok().flatten().map(Value::from)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(index).ok().flatten().map(Value::from)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(index).ok().flatten().map(Value::from)
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(index).ok().flatten().map(Value::from)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<Value>>(index).ok().flatten()
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(index)
            .ok()
            .flatten()
            .map(|t| Value::from(t.to_string()))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(index)
            .ok()
            .flatten()
            .map(|t| Value::from(t.to_rfc3339()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(index)
            .ok()
            .flatten()
            .map(|d| Value::from(d.to_string()))
    } else {
        match row.try_get::<_, Option<String>>(index) {
            Ok(value) => value.map(Value::from),
            Err(_) => {
                warn!(column = row.columns()[index].name(), type_ = %ty, "undecodable column");
                None
            }
        }
    };
    decoded.unwrap_or(Value::Null)
}

fn classify(error: tokio_postgres::Error) -> EngineError {
    if error.is_closed() {
        return EngineError::ConnLost(error.to_string());
    }
    match error.code() {
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            EngineError::Conflict(error.to_string())
        }
        Some(code) if *code == SqlState::QUERY_CANCELED => EngineError::Timeout,
        Some(code)
            if *code == SqlState::ADMIN_SHUTDOWN || *code == SqlState::CRASH_SHUTDOWN =>
        {
            EngineError::ConnLost(error.to_string())
        }
        _ => EngineError::ExecFailed(error.to_string()),
    }
}

fn classify_prepare(error: tokio_postgres::Error) -> EngineError {
    if error.is_closed() {
        EngineError::ConnLost(error.to_string())
    } else {
        EngineError::PrepareFailed(error.to_string())
    }
}
