//! Wire types for the conduit query API.
//!
//! These shapes are what the HTTP front-end serializes; the dispatcher
//! itself only sees the deserialized forms. Response position `i` always
//! corresponds to request position `i`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One query in a request: a reference plus optional named parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    /// Reference into the database's queries table.
    pub query_ref: i64,
    /// Named parameter values, matched against the query's declared
    /// parameter schema.
    #[serde(default)]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Body of `POST /api/conduit/queries`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueriesRequest {
    /// Logical database name.
    pub database: String,
    /// Queries, in caller order.
    pub queries: Vec<QueryRequest>,
}

/// Body of `POST /api/conduit/auth_queries` and `alt_queries`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthQueriesRequest {
    /// Bearer token, validated before anything is dispatched.
    pub token: String,
    /// Logical database name.
    pub database: String,
    /// Queries, in caller order.
    pub queries: Vec<QueryRequest>,
}

/// A row set in a response slot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RowsPayload {
    /// Column names in declaration order.
    pub columns: Vec<String>,
    /// Row values.
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Error detail in a response slot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    /// Stable error kind, e.g. `unknown_query_ref` or `timeout`.
    pub kind: String,
    /// Human readable message.
    pub message: String,
}

/// One response slot; exactly one of `rows`, `row_count`, `error` is set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryResult {
    /// The reference this slot answers.
    pub query_ref: i64,
    /// Row data, for row-returning queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<RowsPayload>,
    /// Affected-row count, for statements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Failure detail; other slots are unaffected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl QueryResult {
    pub(crate) fn error(query_ref: i64, kind: &str, message: impl Into<String>) -> Self {
        Self {
            query_ref,
            rows: None,
            row_count: None,
            error: Some(ErrorBody {
                kind: kind.to_owned(),
                message: message.into(),
            }),
        }
    }
}

/// Phase timings reported alongside results, in microseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Timing {
    /// Validation and deduplication.
    pub validate_us: u64,
    /// Submission onto DQM queues.
    pub queue_us: u64,
    /// Waiting for backend executions.
    pub execute_us: u64,
    /// Fanning results back into caller order.
    pub assemble_us: u64,
}

/// A complete response.
#[derive(Debug, Clone, Serialize)]
pub struct QueriesResponse {
    /// One slot per input query, in input order.
    pub results: Vec<QueryResult>,
    /// Phase timings.
    pub timing: Timing,
}

/// Whole-request failures; per-query failures ride in response slots.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConduitError {
    /// The named database has no configured DQM.
    #[error("unknown database '{0}'")]
    UnknownDatabase(String),
    /// More unique query refs than the database allows per request.
    #[error("{unique} unique query refs exceed the per-request limit of {limit}")]
    RateLimited {
        /// Unique refs after deduplication.
        unique: usize,
        /// The database's configured cap.
        limit: usize,
    },
    /// Token validation failed; nothing was dispatched.
    #[error("authentication failed")]
    AuthFailed,
    /// The request body failed validation.
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ConduitError {
    /// HTTP status the front-end maps this error to.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::UnknownDatabase(_) | Self::BadRequest(_) => 400,
            Self::AuthFailed => 401,
            Self::RateLimited { .. } => 429,
        }
    }
}
