//! The per-database queue manager.
//!
//! Exactly one `Dqm` exists per configured database. It owns the four
//! priority queues and the worker pool, walks the lifecycle
//! `Init -> Launching -> Running -> Draining -> Landed`, and runs the
//! apply phase of migrations on the lead connection before any worker is
//! spawned. Reverse migrations run later through the Slow queue while the
//! other workers keep serving the read tiers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use super::queues::TierQueues;
use super::work::{
    CancelOutcome, Payload, QueueError, Submission, Tier, WorkItem, WorkRequest, DEFAULT_DEADLINE,
};
use super::worker::{self, WorkerContext, WorkerState, WorkerStatusBoard};
use crate::config::DatabaseDescriptor;
use crate::engine::{Engine, EngineError};
use crate::migrate::{MigrateError, MigrationSet, QueriesTable};

/// Grace window for in-flight items when draining.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DqmState {
    /// Constructed, nothing opened yet.
    Init,
    /// Opening connections and applying migrations.
    Launching,
    /// Accepting and serving submissions.
    Running,
    /// No longer accepting; in-flight work finishing.
    Draining,
    /// Workers joined, connections closed.
    Landed,
}

/// Per-queue depth snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierDepths {
    /// Slow queue depth.
    pub slow: usize,
    /// Medium queue depth.
    pub medium: usize,
    /// Fast queue depth.
    pub fast: usize,
    /// Cached queue depth.
    pub cached: usize,
}

/// One worker's slice of a status report.
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus {
    /// Current state.
    pub state: WorkerState,
    /// Time since the worker last finished an item.
    pub last_query_age: Option<Duration>,
}

/// Snapshot returned by [`Dqm::status`].
#[derive(Debug, Clone)]
pub struct DqmStatus {
    /// Lifecycle state.
    pub state: DqmState,
    /// Queue depths.
    pub depths: TierDepths,
    /// Worker states, lead first.
    pub workers: Vec<WorkerStatus>,
}

/// Errors that keep a DQM from reaching `Running`.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A worker connection could not be opened; previously opened
    /// connections were torn down.
    #[error("failed to open connection for worker {worker}: {source}")]
    Connect {
        /// Worker index whose connection failed.
        worker: usize,
        /// Underlying engine error.
        source: EngineError,
    },
    /// The apply phase failed or restart integrity did not hold.
    #[error(transparent)]
    Migration(#[from] MigrateError),
    /// `launch` was called in a state other than `Init` or `Launching`.
    #[error("queue manager cannot launch from its current state")]
    NotLaunchable,
}

struct CancelEntry {
    cancel: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

struct Shared {
    descriptor: Arc<DatabaseDescriptor>,
    engine: Arc<dyn Engine>,
    queues: Arc<TierQueues>,
    state: watch::Sender<DqmState>,
    stop: watch::Sender<bool>,
    migration_active: Arc<AtomicBool>,
    board: Arc<WorkerStatusBoard>,
    cancels: Mutex<HashMap<u64, CancelEntry>>,
    next_id: AtomicU64,
    queries: Mutex<Arc<QueriesTable>>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
}

/// Database queue manager: supervisor for one configured database.
#[derive(Clone)]
pub struct Dqm {
    shared: Arc<Shared>,
}

impl Dqm {
    /// Create a manager in `Init` for one database descriptor.
    #[must_use]
    pub fn new(descriptor: DatabaseDescriptor, engine: Arc<dyn Engine>) -> Self {
        let queue_capacity = descriptor.queue_capacity;
        let workers = descriptor.workers;
        let (state, _) = watch::channel(DqmState::Init);
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                descriptor: Arc::new(descriptor),
                engine,
                queues: Arc::new(TierQueues::new(queue_capacity)),
                state,
                stop,
                migration_active: Arc::new(AtomicBool::new(false)),
                board: Arc::new(WorkerStatusBoard::new(workers)),
                cancels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queries: Mutex::new(Arc::new(QueriesTable::default())),
                workers: tokio::sync::Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// The descriptor this manager was built from.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<DatabaseDescriptor> {
        &self.shared.descriptor
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DqmState {
        *self.shared.state.borrow()
    }

    /// Published queries table snapshot.
    #[must_use]
    pub fn queries(&self) -> Arc<QueriesTable> {
        self.shared
            .queries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Merge query definitions into the published table.
    ///
    /// The normal path populates the table from migration metadata during
    /// launch; hosts that resolve query references elsewhere may publish
    /// additional definitions before the manager starts running.
    pub fn publish_queries(&self, table: QueriesTable) {
        let mut current = self
            .shared
            .queries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut merged = QueriesTable::clone(&current);
        merged.merge(table);
        *current = Arc::new(merged);
    }

    /// Open connections, apply pending migrations on the lead connection,
    /// then start the worker pool and begin accepting submissions.
    ///
    /// On failure the manager stays in `Launching` and accepts nothing;
    /// every connection opened so far is torn down.
    ///
    /// # Errors
    /// [`LaunchError::Connect`] on the first connection failure,
    /// [`LaunchError::Migration`] when loading or applying migrations
    /// fails, including `HashMismatch` on restart integrity violations.
    pub async fn launch(&self) -> Result<(), LaunchError> {
        match self.state() {
            DqmState::Init | DqmState::Launching => {}
            _ => return Err(LaunchError::NotLaunchable),
        }
        self.shared.state.send_replace(DqmState::Launching);
        let descriptor = &self.shared.descriptor;
        info!(database = %descriptor.name, workers = descriptor.workers, "launching queue manager");

        let mut connections = Vec::with_capacity(descriptor.workers);
        for index in 0..descriptor.workers {
            match self.shared.engine.connect(&descriptor.endpoint).await {
                Ok(conn) => connections.push(conn),
                Err(source) => {
                    // Fail fast; close whatever was opened.
                    for mut opened in connections {
                        opened.close().await;
                    }
                    warn!(
                        database = %descriptor.name,
                        worker = index,
                        %source,
                        "connection failed during launch"
                    );
                    return Err(LaunchError::Connect { worker: index, source });
                }
            }
        }

        if let Some(dir) = &descriptor.migrations {
            let set = match MigrationSet::load(dir, descriptor.engine, &descriptor.schema) {
                Ok(set) => set,
                Err(error) => {
                    for mut opened in connections {
                        opened.close().await;
                    }
                    return Err(error.into());
                }
            };
            // The first connection belongs to the lead worker; the apply
            // phase runs on it before any worker exists.
            let lead = connections
                .first_mut()
                .ok_or(LaunchError::NotLaunchable)?;
            match set.apply_pending(lead.as_mut()).await {
                Ok(applied) => {
                    if applied > 0 {
                        info!(database = %descriptor.name, applied, "migrations applied");
                    }
                }
                Err(error) => {
                    for mut opened in connections {
                        opened.close().await;
                    }
                    warn!(database = %descriptor.name, %error, "migration apply failed");
                    return Err(error.into());
                }
            }
            self.publish_queries(set.queries_table());
        }

        let mut workers = self.shared.workers.lock().await;
        for (index, connection) in connections.into_iter().enumerate() {
            let ctx = WorkerContext {
                index,
                lead: index == 0,
                descriptor: Arc::clone(&self.shared.descriptor),
                engine: Arc::clone(&self.shared.engine),
                queues: Arc::clone(&self.shared.queues),
                migration_active: Arc::clone(&self.shared.migration_active),
                board: Arc::clone(&self.shared.board),
            };
            workers.spawn(worker::run(ctx, connection, self.shared.stop.subscribe()));
        }
        drop(workers);
        self.shared.state.send_replace(DqmState::Running);
        info!(database = %descriptor.name, "queue manager running");
        Ok(())
    }

    /// Submit a query for execution.
    ///
    /// # Errors
    /// [`QueueError::NotRunning`] outside `Running`, [`QueueError::QueueFull`]
    /// when the declared tier is at capacity.
    pub fn submit(&self, request: WorkRequest) -> Result<Submission, QueueError> {
        if self.state() != DqmState::Running {
            return Err(QueueError::NotRunning);
        }
        let payload = Payload::Query {
            sql: request.sql,
            params: request.params,
            transactional: request.transactional,
        };
        self.enqueue(
            request.query_ref,
            request.tier,
            payload,
            request.deadline,
            request.retry,
            false,
        )
    }

    /// Submit a migration batch on the Slow queue for the lead worker.
    pub(crate) fn submit_batch(
        &self,
        statements: Vec<String>,
        deadline: Option<Duration>,
    ) -> Result<Submission, QueueError> {
        if self.state() != DqmState::Running {
            return Err(QueueError::NotRunning);
        }
        self.enqueue(
            0,
            Tier::Slow,
            Payload::Batch { statements },
            deadline,
            super::work::RetryPolicy {
                conflict_retries: 0,
            },
            true,
        )
    }

    /// Submit a single lead-only query on the Slow queue; used for the
    /// safety probes of the reverse phase.
    pub(crate) fn submit_lead_query(
        &self,
        sql: String,
        deadline: Option<Duration>,
    ) -> Result<Submission, QueueError> {
        if self.state() != DqmState::Running {
            return Err(QueueError::NotRunning);
        }
        self.enqueue(
            0,
            Tier::Slow,
            Payload::Query {
                sql,
                params: Vec::new(),
                transactional: false,
            },
            deadline,
            super::work::RetryPolicy {
                conflict_retries: 0,
            },
            true,
        )
    }

    fn enqueue(
        &self,
        query_ref: i64,
        tier: Tier,
        payload: Payload,
        deadline: Option<Duration>,
        retry: super::work::RetryPolicy,
        lead_only: bool,
    ) -> Result<Submission, QueueError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (responder, receiver) = oneshot::channel();
        let item = WorkItem {
            id,
            query_ref,
            tier,
            payload,
            deadline: Instant::now() + deadline.unwrap_or(DEFAULT_DEADLINE),
            retry,
            lead_only,
            cancel: Arc::clone(&cancel),
            started: Arc::clone(&started),
            responder,
        };
        if self.shared.queues.push(item).is_err() {
            return Err(QueueError::QueueFull);
        }
        let mut cancels = self
            .shared
            .cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if cancels.len() > 1024 {
            cancels.retain(|_, entry| !entry.started.load(Ordering::Acquire));
        }
        cancels.insert(id, CancelEntry { cancel, started });
        drop(cancels);
        Ok(Submission { id, receiver })
    }

    /// Request cancellation of an enqueued item.
    ///
    /// The item stays on its queue; the worker observes the flag at dequeue
    /// and responds `Cancelled` without executing.
    #[must_use]
    pub fn cancel(&self, id: u64) -> CancelOutcome {
        let cancels = self
            .shared
            .cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match cancels.get(&id) {
            None => CancelOutcome::NotFound,
            Some(entry) if entry.started.load(Ordering::Acquire) => CancelOutcome::AlreadyStarted,
            Some(entry) => {
                entry.cancel.store(true, Ordering::Release);
                CancelOutcome::Cancelled
            }
        }
    }

    /// Snapshot of state, queue depths, and worker states.
    #[must_use]
    pub fn status(&self) -> DqmStatus {
        let raw = self.shared.queues.depths();
        DqmStatus {
            state: self.state(),
            depths: TierDepths {
                slow: raw[Tier::Slow.index()],
                medium: raw[Tier::Medium.index()],
                fast: raw[Tier::Fast.index()],
                cached: raw[Tier::Cached.index()],
            },
            workers: self
                .shared
                .board
                .snapshot()
                .into_iter()
                .map(|(state, last_query_age)| WorkerStatus {
                    state,
                    last_query_age,
                })
                .collect(),
        }
    }

    /// Open the migration window: the lead serves only migration items and
    /// the other workers stay off the Slow tier.
    pub(crate) fn open_migration_window(&self) {
        self.shared.migration_active.store(true, Ordering::Release);
    }

    /// Close the migration window.
    pub(crate) fn close_migration_window(&self) {
        self.shared.migration_active.store(false, Ordering::Release);
        self.shared.queues.wake_all();
    }

    /// Drain and land the manager.
    ///
    /// New submissions are rejected immediately; enqueued-but-unstarted
    /// items are cancelled; in-flight items get `grace` to finish before
    /// their workers are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        match self.state() {
            DqmState::Landed => return,
            DqmState::Init => {
                self.shared.state.send_replace(DqmState::Landed);
                return;
            }
            _ => {}
        }
        self.shared.state.send_replace(DqmState::Draining);
        info!(database = %self.shared.descriptor.name, "draining queue manager");
        for item in self.shared.queues.drain() {
            item.respond(Err(super::work::WorkError::Cancelled));
        }
        let _ = self.shared.stop.send(true);
        self.shared.queues.wake_all();
        let mut workers = self.shared.workers.lock().await;
        let deadline = Instant::now() + grace;
        while !workers.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    database = %self.shared.descriptor.name,
                    stragglers = workers.len(),
                    "grace window elapsed, aborting workers"
                );
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                break;
            }
            match tokio::time::timeout(remaining, workers.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {}
            }
        }
        drop(workers);
        self.shared.state.send_replace(DqmState::Landed);
        info!(database = %self.shared.descriptor.name, "queue manager landed");
    }
}
