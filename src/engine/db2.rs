//! IBM DB2 engine provider, backed by ODBC.
//!
//! DB2 has no usable native Rust driver, so this provider goes through the
//! system unixODBC stack and is therefore behind the `db2` cargo feature.
//! Transactions are driven by toggling the connection autocommit attribute,
//! the ODBC equivalent of an explicit BEGIN. ODBC statement handles borrow
//! their connection, so statements are re-prepared per execution; the
//! statement cache still carries fingerprints, arity, and LRU bookkeeping.
//! A blocking ODBC call cannot be preempted, so the per-item deadline is
//! checked against elapsed time once the call returns and an overrun is
//! reported as a timeout.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment, IntoParameter, ResultSetMetadata};
use tracing::{debug, error};

use super::sql_util::returns_rows;
use super::{
    EngineConnection, EngineError, EngineTag, ExecTarget, Fingerprint, Isolation, Param,
    PreparedRef, QueryOutcome, StatementCache, StatementId, TxState,
};
use crate::config::Endpoint;

const BATCH_SIZE: usize = 256;
const MAX_TEXT_LEN: usize = 4096;

static ENVIRONMENT: LazyLock<Option<Environment>> = LazyLock::new(|| match Environment::new() {
    Ok(env) => Some(env),
    Err(err) => {
        error!(%err, "failed to initialise the ODBC environment");
        None
    }
});

/// Provider for the `db2` engine tag.
pub struct Db2Engine;

#[async_trait]
impl super::Engine for Db2Engine {
    fn tag(&self) -> EngineTag {
        EngineTag::Db2
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn EngineConnection>, EngineError> {
        let environment = ENVIRONMENT
            .as_ref()
            .ok_or_else(|| EngineError::ConnectFailed("ODBC environment unavailable".to_owned()))?;
        let connection_string = connection_string(endpoint);
        let conn = tokio::task::block_in_place(|| {
            environment.connect_with_connection_string(
                &connection_string,
                ConnectionOptions::default(),
            )
        })
        .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;
        debug!(host = endpoint.host.as_deref(), "db2 session opened");
        Ok(Box::new(Db2Session {
            conn: Some(conn),
            cache: StatementCache::default(),
            statements: HashMap::new(),
            next_statement: 0,
            tx: None,
            next_tx: 0,
        }))
    }
}

fn connection_string(endpoint: &Endpoint) -> String {
    let mut parts = vec!["Driver={IBM DB2 ODBC DRIVER}".to_owned(), "Protocol=TCPIP".to_owned()];
    if let Some(host) = &endpoint.host {
        parts.push(format!("Hostname={host}"));
    }
    if let Some(port) = endpoint.port {
        parts.push(format!("Port={port}"));
    }
    if let Some(database) = &endpoint.database {
        parts.push(format!("Database={database}"));
    }
    if let Some(username) = &endpoint.username {
        parts.push(format!("Uid={username}"));
    }
    if let Some(password) = &endpoint.password {
        parts.push(format!("Pwd={password}"));
    }
    parts.join(";")
}

struct Db2Session {
    conn: Option<Connection<'static>>,
    cache: StatementCache,
    statements: HashMap<StatementId, String>,
    next_statement: u64,
    tx: Option<TxState>,
    next_tx: u64,
}

impl Db2Session {
    fn live(&mut self) -> Result<&Connection<'static>, EngineError> {
        self.conn
            .as_ref()
            .ok_or_else(|| EngineError::ConnLost("db2 session is closed".to_owned()))
    }
}

fn boxed_params(params: &[Param]) -> Vec<Box<dyn odbc_api::parameter::InputParameter>> {
    params
        .iter()
        .map(|param| -> Box<dyn odbc_api::parameter::InputParameter> {
            match param {
                Param::Null => Box::new(None::<String>.into_parameter()),
                Param::Bool(value) => Box::new(i16::from(*value).into_parameter()),
                Param::Int(value) => Box::new((*value).into_parameter()),
                Param::Float(value) => Box::new((*value).into_parameter()),
                Param::Text(value) => Box::new(value.clone().into_parameter()),
            }
        })
        .collect()
}

#[async_trait]
impl EngineConnection for Db2Session {
    fn tag(&self) -> EngineTag {
        EngineTag::Db2
    }

    fn tx_state(&self) -> Option<TxState> {
        self.tx
    }

    async fn begin(&mut self, isolation: Isolation) -> Result<(), EngineError> {
        if self.tx.is_some() {
            return Err(EngineError::TxInProgress);
        }
        let conn = self.live()?;
        tokio::task::block_in_place(|| conn.set_autocommit(false))
            .map_err(|e| classify(&e))?;
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
        let conn = self.live()?;
        let result = tokio::task::block_in_place(|| {
            conn.commit()?;
            conn.set_autocommit(true)
        });
        self.tx = None;
        result.map_err(|e| classify(&e))
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        if self.tx.is_none() {
            return Err(EngineError::NoTx);
        }
        let conn = self.live()?;
        let result = tokio::task::block_in_place(|| {
            conn.rollback()?;
            conn.set_autocommit(true)
        });
        self.tx = None;
        match result {
            Ok(()) => Ok(()),
            Err(e) => match classify(&e) {
                EngineError::Conflict(msg) => Err(EngineError::ExecFailed(msg)),
                other => Err(other),
            },
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
            // Validate the statement server-side, then let the handle go;
            // ODBC statement handles cannot outlive this borrow.
            tokio::task::block_in_place(|| conn.prepare(sql)).map_err(|e| {
                let classified = classify(&e);
                if matches!(classified, EngineError::ConnLost(_)) {
                    classified
                } else {
                    EngineError::PrepareFailed(e.to_string())
                }
            })?;
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
        let sql = match target {
            ExecTarget::Prepared(prepared) => self
                .statements
                .get(&prepared.id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::PrepareFailed("statement is no longer cached".to_owned())
                })?,
            ExecTarget::Sql(text) => text.to_owned(),
        };
        let wants_rows = returns_rows(&sql);
        let bound = boxed_params(params);
        let conn = self.live()?;
        let started = tokio::time::Instant::now();
        let outcome = tokio::task::block_in_place(|| run_blocking(conn, &sql, &bound, wants_rows));
        // ODBC gives us no way to interrupt the call itself; enforce the
        // deadline once it returns so overruns still surface as timeouts.
        if let Some(budget) = deadline {
            if started.elapsed() > budget {
                return Err(EngineError::Timeout);
            }
        }
        outcome
    }

    async fn set_statement_timeout(
        &mut self,
        _timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        // The ODBC driver owns statement timeouts; nothing to adjust from
        // this side per call.
        self.live().map(|_| ())
    }

    async fn deallocate_all(&mut self) -> Result<(), EngineError> {
        for id in self.cache.clear() {
            self.statements.remove(&id);
        }
        self.live().map(|_| ())
    }

    async fn close(&mut self) {
        let _ = self.deallocate_all().await;
        self.conn = None;
        self.tx = None;
    }
}

fn run_blocking(
    conn: &Connection<'static>,
    sql: &str,
    params: &[Box<dyn odbc_api::parameter::InputParameter>],
    wants_rows: bool,
) -> Result<QueryOutcome, EngineError> {
    let mut statement = conn.preallocate().map_err(|e| classify(&e))?;
    let cursor = statement
        .execute(sql, params)
        .map_err(|e| classify(&e))?;
    match cursor {
        Some(mut cursor) if wants_rows => {
            let columns: Vec<String> = cursor
                .column_names()
                .map_err(|e| classify(&e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| classify(&e))?;
            let mut buffers = TextRowSet::for_cursor(BATCH_SIZE, &mut cursor, Some(MAX_TEXT_LEN))
                .map_err(|e| classify(&e))?;
            let mut block = cursor
                .bind_buffer(&mut buffers)
                .map_err(|e| classify(&e))?;
            let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
            while let Some(batch) = block.fetch().map_err(|e| classify(&e))? {
                for row in 0..batch.num_rows() {
                    let values = (0..batch.num_cols())
                        .map(|col| {
                            batch.at(col, row).map_or(serde_json::Value::Null, |bytes| {
                                serde_json::Value::from(
                                    String::from_utf8_lossy(bytes).into_owned(),
                                )
                            })
                        })
                        .collect();
                    rows.push(values);
                }
            }
            Ok(QueryOutcome::Rows { columns, rows })
        }
        other => {
            drop(other);
            let count = statement
                .row_count()
                .map_err(|e| classify(&e))?
                .unwrap_or_default();
            Ok(QueryOutcome::RowCount(u64::try_from(count).unwrap_or_default()))
        }
    }
}

fn classify(error: &odbc_api::Error) -> EngineError {
    let message = error.to_string();
    // SQLSTATE class 08 covers connection exceptions; 40 covers rollback
    // and serialization failures.
    if message.contains("08001") || message.contains("08003") || message.contains("08S01") {
        EngineError::ConnLost(message)
    } else if message.contains("40001") {
        EngineError::Conflict(message)
    } else if message.contains("HYT00") || message.contains("HYT01") {
        EngineError::Timeout
    } else {
        EngineError::ExecFailed(message)
    }
}
