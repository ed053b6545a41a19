//! Engine abstraction layer.
//!
//! Every backend engine is exposed through the same capability set: connect,
//! prepare, execute, transact, disconnect. Providers live in their own
//! modules behind cargo features and register with the process-wide
//! [`Registry`]. Connections are exclusively owned by one DQM worker for
//! their whole lifetime and are therefore never synchronised internally.

mod cache;
mod fingerprint;
mod registry;
mod sql_util;

#[cfg(feature = "db2")]
pub mod db2;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::{StatementCache, DEFAULT_STATEMENT_CACHE_CAPACITY};
pub use fingerprint::{fingerprint, normalize_sql, Fingerprint};
pub use registry::Registry;

use crate::config::Endpoint;

/// Closed set of supported engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineTag {
    /// PostgreSQL over the native wire protocol.
    Postgres,
    /// MySQL or MariaDB.
    Mysql,
    /// SQLite, in-process.
    Sqlite,
    /// IBM DB2 over ODBC.
    Db2,
}

impl EngineTag {
    /// Parse a configuration `type` value, accepting the common aliases.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::Mysql),
            "sqlite" => Some(Self::Sqlite),
            "db2" => Some(Self::Db2),
            _ => None,
        }
    }

    /// Canonical lowercase name, as stored in the applied-migration table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
            Self::Db2 => "db2",
        }
    }
}

impl fmt::Display for EngineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by engine providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The backend rejected or never answered the connection attempt.
    #[error("failed to connect to backend: {0}")]
    ConnectFailed(String),
    /// The session died underneath us; the connection is now `Closed`.
    #[error("connection to backend lost: {0}")]
    ConnLost(String),
    /// `begin` was called while a transaction was already open.
    #[error("transaction already in progress")]
    TxInProgress,
    /// `commit` or `rollback` was called with no open transaction.
    #[error("no transaction in progress")]
    NoTx,
    /// The backend refused to prepare the statement.
    #[error("prepare failed: {0}")]
    PrepareFailed(String),
    /// The backend reported an execution error.
    #[error("execution failed: {0}")]
    ExecFailed(String),
    /// The statement exceeded its deadline.
    #[error("statement deadline exceeded")]
    Timeout,
    /// Serialization failure or deadlock; retryable per the work item's
    /// retry policy.
    #[error("transaction conflict: {0}")]
    Conflict(String),
}

/// Transaction isolation levels a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Engine default; what almost all Hydrogen queries run under.
    #[default]
    ReadCommitted,
    /// Serializable, for migration bookkeeping that must not interleave.
    Serializable,
}

/// In-flight transaction state carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxState {
    /// Connection-local transaction counter.
    pub id: u64,
    /// Isolation the transaction was opened with.
    pub isolation: Isolation,
    /// Nesting depth; always 1 today since nested begins are refused.
    pub depth: u32,
}

/// Opaque identifier of a prepared statement held by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(
    /// Connection-local statement counter value.
    pub u64,
);

/// Handle returned by `prepare`, valid for the owning connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedRef {
    /// Provider-local statement identifier.
    pub id: StatementId,
    /// Number of parameters the statement binds.
    pub arity: usize,
}

/// What `execute` should run: a previously prepared statement or raw SQL.
#[derive(Debug, Clone, Copy)]
pub enum ExecTarget<'a> {
    /// A statement previously returned by `prepare` on this connection.
    Prepared(PreparedRef),
    /// One-shot SQL, executed without touching the statement cache.
    Sql(&'a str),
}

/// A query parameter value.
///
/// Parameters always travel through each engine's native bind interface;
/// they are never spliced into SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

impl Param {
    /// Convert a JSON value into a bindable parameter.
    ///
    /// # Errors
    /// Returns `ExecFailed` for arrays and objects, which no engine binds
    /// directly.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, EngineError> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => n.as_i64().map_or_else(
                || {
                    n.as_f64().map(Self::Float).ok_or_else(|| {
                        EngineError::ExecFailed(format!("unbindable number {n}"))
                    })
                },
                |i| Ok(Self::Int(i)),
            ),
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(EngineError::ExecFailed(
                "array and object parameters are not bindable".to_owned(),
            )),
        }
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// A row set, with column names in declaration order.
    Rows {
        /// Column names.
        columns: Vec<String>,
        /// Row values, one JSON value per column.
        rows: Vec<Vec<serde_json::Value>>,
    },
    /// Number of rows affected by a statement that returns no rows.
    RowCount(u64),
}

impl QueryOutcome {
    /// Number of rows carried or affected.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Rows { rows, .. } => rows.len() as u64,
            Self::RowCount(n) => *n,
        }
    }
}

/// A provider capability table: one registered object per engine tag.
#[async_trait]
pub trait Engine: Send + Sync {
    /// The tag this provider registered under.
    fn tag(&self) -> EngineTag;

    /// Open a live session to the backend.
    ///
    /// Providers install their per-connection statement timeout here; no
    /// later operation re-sets the timeout per call.
    ///
    /// # Errors
    /// Returns [`EngineError::ConnectFailed`] when the session cannot be
    /// established.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn EngineConnection>, EngineError>;
}

/// A live session to one backend, exclusively owned by one worker.
///
/// State machine: `Idle -> InTx (begin) -> Idle (commit|rollback)`, with
/// `ConnLost` from any state landing the connection in `Closed`.
#[async_trait]
pub trait EngineConnection: Send {
    /// The engine this connection belongs to.
    fn tag(&self) -> EngineTag;

    /// Current transaction state, if a transaction is open.
    fn tx_state(&self) -> Option<TxState>;

    /// Open a transaction.
    ///
    /// # Errors
    /// `TxInProgress` when a transaction is already open; `ConnLost` when
    /// the session died.
    async fn begin(&mut self, isolation: Isolation) -> Result<(), EngineError>;

    /// Commit the open transaction.
    ///
    /// # Errors
    /// `NoTx` without an open transaction; `Conflict` when the backend
    /// refuses the commit; `ConnLost` when the session died.
    async fn commit(&mut self) -> Result<(), EngineError>;

    /// Roll back the open transaction. Always finalises the transaction
    /// state; never reports `Conflict`.
    ///
    /// # Errors
    /// `NoTx` without an open transaction; `ConnLost` when the session died.
    async fn rollback(&mut self) -> Result<(), EngineError>;

    /// Prepare `sql` under `fingerprint`, or return the cached handle.
    ///
    /// Idempotent: preparing an already-cached fingerprint touches the LRU
    /// entry and returns the existing handle without growing the cache.
    ///
    /// # Errors
    /// `PrepareFailed` when the backend rejects the statement; `ConnLost`
    /// when the session died.
    async fn prepare(
        &mut self,
        fingerprint: &Fingerprint,
        sql: &str,
        arity: usize,
    ) -> Result<PreparedRef, EngineError>;

    /// Execute a prepared statement or raw SQL with bound parameters.
    ///
    /// `deadline` is the remaining wall-clock budget computed by the worker
    /// at dequeue; `None` means unbounded (migration path only).
    ///
    /// # Errors
    /// `ExecFailed`, `Timeout`, `ConnLost`, or `Conflict` as reported by
    /// the backend.
    async fn execute(
        &mut self,
        target: ExecTarget<'_>,
        params: &[Param],
        deadline: Option<Duration>,
    ) -> Result<QueryOutcome, EngineError>;

    /// Raise or disable the connection-level statement timeout. Used by the
    /// migration path on the lead worker only.
    ///
    /// # Errors
    /// `ConnLost` when the session died.
    async fn set_statement_timeout(&mut self, timeout: Option<Duration>) -> Result<(), EngineError>;

    /// Release every cached prepared statement, batched where the wire
    /// protocol permits.
    ///
    /// # Errors
    /// `ConnLost` when the session died.
    async fn deallocate_all(&mut self) -> Result<(), EngineError>;

    /// Tear the session down. Idempotent; releases prepared statements and
    /// then the backend handle.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("postgres", Some(EngineTag::Postgres))]
    #[case("PostgreSQL", Some(EngineTag::Postgres))]
    #[case("mariadb", Some(EngineTag::Mysql))]
    #[case("MySQL", Some(EngineTag::Mysql))]
    #[case("sqlite", Some(EngineTag::Sqlite))]
    #[case("DB2", Some(EngineTag::Db2))]
    #[case("oracle", None)]
    fn engine_tag_parsing(#[case] input: &str, #[case] expected: Option<EngineTag>) {
        assert_eq!(EngineTag::parse(input), expected);
    }

    #[rstest]
    fn params_from_json() {
        use serde_json::json;
        assert_eq!(Param::from_json(&json!(null)).unwrap(), Param::Null);
        assert_eq!(Param::from_json(&json!(true)).unwrap(), Param::Bool(true));
        assert_eq!(Param::from_json(&json!(7)).unwrap(), Param::Int(7));
        assert_eq!(Param::from_json(&json!(1.5)).unwrap(), Param::Float(1.5));
        assert_eq!(
            Param::from_json(&json!("x")).unwrap(),
            Param::Text("x".to_owned())
        );
        assert!(Param::from_json(&json!([1])).is_err());
    }
}
