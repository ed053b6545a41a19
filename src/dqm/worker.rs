//! The DQM worker loop.
//!
//! One worker owns one live connection for its entire lifetime. It blocks
//! on queue wakeups, dequeues by strict tier priority, and runs each item
//! through the engine provider, reconnecting with bounded exponential
//! backoff when the session drops. A stop request preempts both the idle
//! wait and the backoff sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::queues::TierQueues;
use super::work::{Payload, WorkError, WorkItem};
use crate::config::DatabaseDescriptor;
use crate::engine::{
    fingerprint, Engine, EngineConnection, EngineError, ExecTarget, Isolation, Param,
    QueryOutcome,
};

/// Backoff schedule for reconnect attempts: 100 ms growing fourfold to the
/// 6.4 s cap, five tries in total.
const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_CAP: Duration = Duration::from_millis(6400);
const RECONNECT_TRIES: u32 = 5;
/// Statement timeout restored after a migration batch lifts it.
const RESTORED_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Connected, waiting for work.
    Idle,
    /// Executing a query.
    Busy {
        /// Query reference of the running item.
        query_ref: i64,
    },
    /// Re-establishing a lost connection.
    Reconnecting,
    /// Running a migration batch (lead worker only).
    Migrating,
    /// The worker has exited and its connection is closed.
    Stopped,
}

#[derive(Debug)]
struct WorkerSlot {
    state: WorkerState,
    last_finished: Option<Instant>,
}

/// Shared board the supervisor reads for `status()`.
#[derive(Debug)]
pub(crate) struct WorkerStatusBoard {
    slots: Vec<Mutex<WorkerSlot>>,
}

impl WorkerStatusBoard {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers)
                .map(|_| {
                    Mutex::new(WorkerSlot {
                        state: WorkerState::Idle,
                        last_finished: None,
                    })
                })
                .collect(),
        }
    }

    fn set_state(&self, index: usize, state: WorkerState) {
        if let Some(slot) = self.slots.get(index) {
            let mut slot = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.state = state;
        }
    }

    fn mark_finished(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            let mut slot = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.last_finished = Some(Instant::now());
        }
    }

    /// Snapshot of every worker: state and time since its last completion.
    pub(crate) fn snapshot(&self) -> Vec<(WorkerState, Option<Duration>)> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|slot| {
                let slot = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                (slot.state, slot.last_finished.map(|at| now - at))
            })
            .collect()
    }
}

/// Everything a worker needs, cloned per worker at launch.
pub(crate) struct WorkerContext {
    pub index: usize,
    pub lead: bool,
    pub descriptor: Arc<DatabaseDescriptor>,
    pub engine: Arc<dyn Engine>,
    pub queues: Arc<TierQueues>,
    pub migration_active: Arc<AtomicBool>,
    pub board: Arc<WorkerStatusBoard>,
}

/// Worker task body. Runs until a stop request, then closes its connection.
pub(crate) async fn run(
    ctx: WorkerContext,
    connection: Box<dyn EngineConnection>,
    mut shutdown: watch::Receiver<bool>,
) {
    let database = ctx.descriptor.name.clone();
    let worker = ctx.index;
    let mut conn = Some(connection);
    debug!(%database, worker, lead = ctx.lead, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let migration_active = ctx.migration_active.load(Ordering::Acquire);
        let Some(item) = ctx.queues.pop(ctx.lead, migration_active) else {
            ctx.board.set_state(worker, WorkerState::Idle);
            tokio::select! {
                () = ctx.queues.wait() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };
        if item.cancelled() {
            item.respond(Err(WorkError::Cancelled));
            continue;
        }
        item.mark_started();
        let state = match &item.payload {
            Payload::Batch { .. } => WorkerState::Migrating,
            Payload::Query { .. } => WorkerState::Busy {
                query_ref: item.query_ref,
            },
        };
        ctx.board.set_state(worker, state);
        process_item(&ctx, &mut conn, item, &mut shutdown).await;
        ctx.board.mark_finished(worker);
    }
    if let Some(mut connection) = conn.take() {
        connection.close().await;
    }
    ctx.board.set_state(worker, WorkerState::Stopped);
    debug!(%database, worker, "worker stopped");
}

async fn process_item(
    ctx: &WorkerContext,
    conn: &mut Option<Box<dyn EngineConnection>>,
    item: WorkItem,
    shutdown: &mut watch::Receiver<bool>,
) {
    // Step one: make sure the connection is healthy before touching the
    // payload at all.
    if conn.is_none() {
        ctx.board.set_state(ctx.index, WorkerState::Reconnecting);
        match reconnect(ctx, shutdown).await {
            Ok(fresh) => *conn = Some(fresh),
            Err(error) => {
                item.respond(Err(WorkError::Engine(error)));
                return;
            }
        }
    }
    let mut conflict_budget = item.retry.conflict_retries;
    let mut reconnect_budget = 1u32;
    loop {
        let Some(connection) = conn.as_mut() else {
            item.respond(Err(WorkError::Engine(EngineError::ConnLost(
                "no live connection".to_owned(),
            ))));
            return;
        };
        let Some(remaining) = item.deadline.checked_duration_since(Instant::now()) else {
            item.respond(Err(WorkError::Engine(EngineError::Timeout)));
            return;
        };
        let result = match &item.payload {
            Payload::Query {
                sql,
                params,
                transactional,
            } => run_query(connection.as_mut(), sql, params, *transactional, remaining).await,
            Payload::Batch { statements } => run_batch(connection.as_mut(), statements).await,
        };
        match result {
            Ok(outcome) => {
                item.respond(Ok(outcome));
                return;
            }
            Err(EngineError::ConnLost(cause)) if reconnect_budget > 0 => {
                reconnect_budget -= 1;
                warn!(
                    database = %ctx.descriptor.name,
                    worker = ctx.index,
                    %cause,
                    "connection lost mid-item, reconnecting"
                );
                *conn = None;
                ctx.board.set_state(ctx.index, WorkerState::Reconnecting);
                match reconnect(ctx, shutdown).await {
                    Ok(fresh) => *conn = Some(fresh),
                    Err(error) => {
                        item.respond(Err(WorkError::Engine(error)));
                        return;
                    }
                }
            }
            Err(EngineError::Conflict(cause)) if conflict_budget > 0 => {
                conflict_budget -= 1;
                debug!(
                    database = %ctx.descriptor.name,
                    worker = ctx.index,
                    %cause,
                    "conflict, retrying once"
                );
            }
            Err(error) => {
                item.respond(Err(WorkError::Engine(error)));
                return;
            }
        }
    }
}

/// Execute one query, optionally inside a transaction that is rolled back
/// on any failure.
async fn run_query(
    conn: &mut dyn EngineConnection,
    sql: &str,
    params: &[Param],
    transactional: bool,
    remaining: Duration,
) -> Result<QueryOutcome, EngineError> {
    if transactional {
        conn.begin(Isolation::ReadCommitted).await?;
    }
    let outcome = execute_prepared(conn, sql, params, remaining).await;
    if transactional {
        match &outcome {
            Ok(_) => conn.commit().await?,
            Err(_) => {
                // Preserve the original error; rollback failures only matter
                // when the session is already gone.
                if let Err(EngineError::ConnLost(cause)) = conn.rollback().await {
                    return Err(EngineError::ConnLost(cause));
                }
            }
        }
    }
    outcome
}

async fn execute_prepared(
    conn: &mut dyn EngineConnection,
    sql: &str,
    params: &[Param],
    remaining: Duration,
) -> Result<QueryOutcome, EngineError> {
    let print = fingerprint(sql);
    let prepared = conn.prepare(&print, sql, params.len()).await?;
    conn.execute(ExecTarget::Prepared(prepared), params, Some(remaining))
        .await
}

/// Run a migration batch: statement timeout lifted, one transaction around
/// the whole sequence, rollback on the first failure.
async fn run_batch(
    conn: &mut dyn EngineConnection,
    statements: &[String],
) -> Result<QueryOutcome, EngineError> {
    conn.set_statement_timeout(None).await?;
    let result = run_batch_tx(conn, statements).await;
    // Best effort: the restored value matters only for later user queries.
    let _ = conn
        .set_statement_timeout(Some(RESTORED_STATEMENT_TIMEOUT))
        .await;
    result
}

async fn run_batch_tx(
    conn: &mut dyn EngineConnection,
    statements: &[String],
) -> Result<QueryOutcome, EngineError> {
    conn.begin(Isolation::ReadCommitted).await?;
    let mut affected = 0u64;
    for statement in statements {
        match conn.execute(ExecTarget::Sql(statement), &[], None).await {
            Ok(outcome) => affected += outcome.row_count(),
            Err(error) => {
                let _ = conn.rollback().await;
                return Err(error);
            }
        }
    }
    conn.commit().await?;
    Ok(QueryOutcome::RowCount(affected))
}

/// Re-establish the worker's connection with exponential backoff. A stop
/// request interrupts the backoff sleep immediately.
async fn reconnect(
    ctx: &WorkerContext,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Box<dyn EngineConnection>, EngineError> {
    let mut delay = RECONNECT_BASE;
    let mut last_error = EngineError::ConnLost("reconnect never attempted".to_owned());
    for attempt in 1..=RECONNECT_TRIES {
        match ctx.engine.connect(&ctx.descriptor.endpoint).await {
            Ok(conn) => {
                info!(
                    database = %ctx.descriptor.name,
                    worker = ctx.index,
                    attempt,
                    "reconnected"
                );
                return Ok(conn);
            }
            Err(error) => {
                warn!(
                    database = %ctx.descriptor.name,
                    worker = ctx.index,
                    attempt,
                    %error,
                    "reconnect attempt failed"
                );
                last_error = error;
            }
        }
        if attempt == RECONNECT_TRIES {
            break;
        }
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        tokio::select! {
            () = sleep(delay.mul_f64(jitter)) => {}
            _ = shutdown.changed() => {
                return Err(EngineError::ConnLost("stop requested during reconnect".to_owned()));
            }
        }
        delay = (delay * 4).min(RECONNECT_CAP);
    }
    Err(match last_error {
        EngineError::ConnectFailed(cause) | EngineError::ConnLost(cause) => {
            EngineError::ConnLost(cause)
        }
        other => other,
    })
}
