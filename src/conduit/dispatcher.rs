//! The conduit dispatcher.
//!
//! Pipeline per request: validate, deduplicate query refs by first
//! occurrence, rate-limit the canonical list, dispatch each canonical
//! query onto its declared tier, then assemble results back into caller
//! order. A failing query occupies its own slot; the batch survives.

#![allow(
    clippy::indexing_slicing,
    reason = "canonical slots and input indices are built from this request"
)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::auth::{Identity, TokenValidator};
use super::types::{
    AuthQueriesRequest, ConduitError, QueriesRequest, QueriesResponse, QueryRequest, QueryResult,
    RowsPayload, Timing,
};
use crate::dqm::{Dqm, Submission, WorkRequest, DEFAULT_DEADLINE};
use crate::engine::{Param, QueryOutcome};
use crate::migrate::QueryDef;

/// The conduit query API over a set of launched DQMs.
pub struct Conduit {
    dqms: HashMap<String, Dqm>,
    validator: Arc<dyn TokenValidator>,
}

impl Conduit {
    /// Build a conduit over `dqms` with `validator` guarding the
    /// authenticated operations.
    #[must_use]
    pub fn new(dqms: HashMap<String, Dqm>, validator: Arc<dyn TokenValidator>) -> Self {
        Self { dqms, validator }
    }

    /// `POST /api/conduit/queries`: dispatch without an auth context.
    ///
    /// # Errors
    /// Whole-request failures only; see [`ConduitError`].
    pub async fn queries(&self, request: QueriesRequest) -> Result<QueriesResponse, ConduitError> {
        self.run(&request.database, request.queries, None).await
    }

    /// `POST /api/conduit/auth_queries`: validate the token, then dispatch
    /// with the caller identity available to `identity.*` parameters.
    ///
    /// # Errors
    /// [`ConduitError::AuthFailed`] before anything is dispatched, plus
    /// the whole-request failures of [`Conduit::queries`].
    pub async fn auth_queries(
        &self,
        request: AuthQueriesRequest,
    ) -> Result<QueriesResponse, ConduitError> {
        let identity = self
            .validator
            .validate(&request.token)
            .await
            .map_err(|_| ConduitError::AuthFailed)?;
        self.run(&request.database, request.queries, Some(identity))
            .await
    }

    /// `POST /api/conduit/alt_queries`: the strict variant where every
    /// field is required and must be well formed.
    ///
    /// # Errors
    /// Same as [`Conduit::auth_queries`], plus `BadRequest` for an empty
    /// token.
    pub async fn alt_queries(
        &self,
        request: AuthQueriesRequest,
    ) -> Result<QueriesResponse, ConduitError> {
        if request.token.is_empty() {
            return Err(ConduitError::BadRequest("token must not be empty".to_owned()));
        }
        if request.database.is_empty() {
            return Err(ConduitError::BadRequest(
                "database must not be empty".to_owned(),
            ));
        }
        self.auth_queries(request).await
    }

    async fn run(
        &self,
        database: &str,
        queries: Vec<QueryRequest>,
        identity: Option<Identity>,
    ) -> Result<QueriesResponse, ConduitError> {
        let started = Instant::now();
        let dqm = self
            .dqms
            .get(database)
            .ok_or_else(|| ConduitError::UnknownDatabase(database.to_owned()))?;
        if queries.is_empty() {
            return Err(ConduitError::BadRequest(
                "queries must be a non-empty list".to_owned(),
            ));
        }

        // First-occurrence deduplication: canonical holds input indices,
        // mapping sends every input position to its canonical slot.
        let mut canonical: Vec<usize> = Vec::new();
        let mut mapping: Vec<usize> = Vec::with_capacity(queries.len());
        let mut seen: HashMap<i64, usize> = HashMap::new();
        for (index, query) in queries.iter().enumerate() {
            let slot = *seen.entry(query.query_ref).or_insert_with(|| {
                canonical.push(index);
                canonical.len() - 1
            });
            mapping.push(slot);
        }

        let limit = dqm.descriptor().max_queries_per_request;
        if canonical.len() > limit {
            debug!(
                database,
                unique = canonical.len(),
                limit,
                "conduit request rate limited"
            );
            return Err(ConduitError::RateLimited {
                unique: canonical.len(),
                limit,
            });
        }

        let table = dqm.queries();
        let mut timing = Timing {
            validate_us: elapsed_us(started),
            ..Timing::default()
        };

        // Dispatch phase: submit every canonical query; failures become
        // their slot's result without sinking the batch.
        let queue_started = Instant::now();
        let mut pending: Vec<Result<(i64, Submission), QueryResult>> =
            Vec::with_capacity(canonical.len());
        for &input_index in &canonical {
            let query = &queries[input_index];
            pending.push(self.dispatch_one(dqm, &table, query, identity.as_ref()));
        }
        timing.queue_us = elapsed_us(queue_started);

        // Execution phase: wait for every canonical result under the
        // request deadline.
        let execute_started = Instant::now();
        let canonical_results: Vec<QueryResult> =
            join_all(pending.into_iter().map(|slot| async move {
                match slot {
                    Err(result) => result,
                    Ok((query_ref, submission)) => {
                        await_result(query_ref, submission, DEFAULT_DEADLINE).await
                    }
                }
            }))
            .await;
        timing.execute_us = elapsed_us(execute_started);

        // Assembly: response position i answers input position i, with
        // duplicate refs sharing their canonical execution.
        let assemble_started = Instant::now();
        let results: Vec<QueryResult> = mapping
            .iter()
            .map(|&slot| canonical_results[slot].clone())
            .collect();
        timing.assemble_us = elapsed_us(assemble_started);

        Ok(QueriesResponse { results, timing })
    }

    fn dispatch_one(
        &self,
        dqm: &Dqm,
        table: &crate::migrate::QueriesTable,
        query: &QueryRequest,
        identity: Option<&Identity>,
    ) -> Result<(i64, Submission), QueryResult> {
        let query_ref = query.query_ref;
        let Some(def) = table.get(query_ref) else {
            return Err(QueryResult::error(
                query_ref,
                "unknown_query_ref",
                format!("no query is registered under ref {query_ref}"),
            ));
        };
        let params = bind_params(def, query.params.as_ref(), identity)
            .map_err(|message| QueryResult::error(query_ref, "bad_params", message))?;
        let mut request = WorkRequest::new(query_ref, def.tier, def.sql.clone(), params);
        request.transactional = def.transactional;
        match dqm.submit(request) {
            Ok(submission) => Ok((query_ref, submission)),
            Err(error) => Err(QueryResult::error(
                query_ref,
                queue_error_kind(&error),
                error.to_string(),
            )),
        }
    }
}

fn queue_error_kind(error: &crate::dqm::QueueError) -> &'static str {
    match error {
        crate::dqm::QueueError::QueueFull => "queue_full",
        crate::dqm::QueueError::Cancelled => "cancelled",
        crate::dqm::QueueError::NotRunning => "not_running",
    }
}

async fn await_result(query_ref: i64, submission: Submission, budget: Duration) -> QueryResult {
    match timeout(budget, submission.receiver).await {
        Err(_) => QueryResult::error(query_ref, "timeout", "request deadline exceeded"),
        Ok(Err(_)) => QueryResult::error(query_ref, "not_running", "worker went away"),
        Ok(Ok(Err(error))) => QueryResult::error(query_ref, "execution", error.to_string()),
        Ok(Ok(Ok(outcome))) => match outcome {
            QueryOutcome::Rows { columns, rows } => QueryResult {
                query_ref,
                rows: Some(RowsPayload { columns, rows }),
                row_count: None,
                error: None,
            },
            QueryOutcome::RowCount(count) => QueryResult {
                query_ref,
                rows: None,
                row_count: Some(count),
                error: None,
            },
        },
    }
}

/// Bind request parameters against the query's declared schema, in
/// declaration order. `identity.*` names read from the validated identity.
fn bind_params(
    def: &QueryDef,
    provided: Option<&serde_json::Map<String, serde_json::Value>>,
    identity: Option<&Identity>,
) -> Result<Vec<Param>, String> {
    let mut params = Vec::with_capacity(def.params.len());
    for name in &def.params {
        let value = if let Some(claim) = name.strip_prefix("identity.") {
            let identity =
                identity.ok_or_else(|| format!("parameter '{name}' needs an auth context"))?;
            if claim == "subject" {
                serde_json::Value::String(identity.subject.clone())
            } else {
                identity
                    .claims
                    .get(claim)
                    .cloned()
                    .ok_or_else(|| format!("identity carries no claim '{claim}'"))?
            }
        } else {
            provided
                .and_then(|map| map.get(name))
                .cloned()
                .ok_or_else(|| format!("missing parameter '{name}'"))?
        };
        params.push(Param::from_json(&value).map_err(|e| e.to_string())?);
    }
    Ok(params)
}

fn elapsed_us(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX)
}
