//! The conduit query API: the core's only inbound surface.
//!
//! Callers submit queries by reference against a named database and get an
//! ordered response back; everything else (HTTP framing, WebSocket fanout)
//! belongs to the host.

mod auth;
mod dispatcher;
mod types;

pub use auth::{Identity, RejectAll, StaticTokens, TokenRejected, TokenValidator};
pub use dispatcher::Conduit;
pub use types::{
    AuthQueriesRequest, ConduitError, ErrorBody, QueriesRequest, QueriesResponse, QueryRequest,
    QueryResult, RowsPayload, Timing,
};
