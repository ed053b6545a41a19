//! A scriptable in-process engine.
//!
//! `ScriptedEngine` implements the engine capability traits without any
//! backend: tests script responses per SQL fragment, inject connection and
//! execution failures, hold statements open to control scheduling, and then
//! assert on the recorded event log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hydrogen::config::Endpoint;
use hydrogen::engine::{
    Engine, EngineConnection, EngineError, EngineTag, ExecTarget, Fingerprint, Isolation, Param,
    PreparedRef, QueryOutcome, StatementCache, StatementId, TxState,
};
use tokio::sync::watch;
use tokio::time::timeout;

/// Everything the engine did, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A connection was opened.
    Connect,
    /// A transaction began.
    Begin,
    /// A transaction committed.
    Commit,
    /// A transaction rolled back.
    Rollback,
    /// A statement executed.
    Execute {
        /// The SQL text.
        sql: String,
        /// Bound parameters.
        params: Vec<Param>,
    },
    /// A connection closed.
    Close,
}

struct Rule {
    matcher: String,
    responses: VecDeque<Result<QueryOutcome, EngineError>>,
}

struct Hold {
    matcher: String,
    release: watch::Receiver<bool>,
    entered: Arc<AtomicBool>,
}

#[derive(Default)]
struct Script {
    events: Vec<MockEvent>,
    rules: Vec<Rule>,
    holds: Vec<Hold>,
    connect_failures: u32,
    connects: usize,
}

/// Handle to release a held statement.
pub struct HoldHandle {
    release: watch::Sender<bool>,
    entered: Arc<AtomicBool>,
}

impl HoldHandle {
    /// Let every waiter (current and future) through.
    pub fn release(&self) {
        let _ = self.release.send(true);
    }

    /// Whether a worker has reached the hold.
    #[must_use]
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }

    /// Wait until a worker reaches the hold.
    pub async fn entered_wait(&self) {
        while !self.entered() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Scriptable engine provider; clones share the same script and log.
#[derive(Clone)]
pub struct ScriptedEngine {
    tag: EngineTag,
    script: Arc<Mutex<Script>>,
    live_connections: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    /// Engine registering under `tag`.
    #[must_use]
    pub fn new(tag: EngineTag) -> Self {
        Self {
            tag,
            script: Arc::new(Mutex::new(Script::default())),
            live_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Engine under the `sqlite` tag, the usual choice for tests.
    #[must_use]
    pub fn sqlite() -> Self {
        Self::new(EngineTag::Sqlite)
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.lock().connect_failures = n;
    }

    /// Script one response for the next execution whose SQL contains
    /// `matcher`. Responses for the same matcher queue up in order.
    pub fn respond_once(&self, matcher: &str, response: Result<QueryOutcome, EngineError>) {
        let mut script = self.lock();
        if let Some(rule) = script.rules.iter_mut().find(|r| r.matcher == matcher) {
            rule.responses.push_back(response);
        } else {
            script.rules.push(Rule {
                matcher: matcher.to_owned(),
                responses: VecDeque::from([response]),
            });
        }
    }

    /// Hold every execution whose SQL contains `matcher` until the
    /// returned handle is released.
    pub fn hold(&self, matcher: &str) -> HoldHandle {
        let (tx, rx) = watch::channel(false);
        let entered = Arc::new(AtomicBool::new(false));
        self.lock().holds.push(Hold {
            matcher: matcher.to_owned(),
            release: rx,
            entered: Arc::clone(&entered),
        });
        HoldHandle {
            release: tx,
            entered,
        }
    }

    /// Every event recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// The SQL of every executed statement, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                MockEvent::Execute { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many connections were opened over the engine's lifetime.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// How many connections are currently open.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, event: MockEvent) {
        self.lock().events.push(event);
    }

    fn take_response(&self, sql: &str) -> Option<Result<QueryOutcome, EngineError>> {
        let mut script = self.lock();
        script
            .rules
            .iter_mut()
            .find(|rule| sql.contains(&rule.matcher))
            .and_then(|rule| rule.responses.pop_front())
    }

    fn find_hold(&self, sql: &str) -> Option<(watch::Receiver<bool>, Arc<AtomicBool>)> {
        let script = self.lock();
        script
            .holds
            .iter()
            .find(|hold| sql.contains(&hold.matcher))
            .map(|hold| (hold.release.clone(), Arc::clone(&hold.entered)))
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn tag(&self) -> EngineTag {
        self.tag
    }

    async fn connect(
        &self,
        _endpoint: &Endpoint,
    ) -> Result<Box<dyn EngineConnection>, EngineError> {
        {
            let mut script = self.lock();
            script.connects += 1;
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(EngineError::ConnectFailed("scripted failure".to_owned()));
            }
            script.events.push(MockEvent::Connect);
        }
        self.live_connections.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ScriptedConnection {
            engine: self.clone(),
            cache: StatementCache::default(),
            statements: std::collections::HashMap::new(),
            next_statement: 0,
            tx: None,
            next_tx: 0,
            closed: false,
        }))
    }
}

struct ScriptedConnection {
    engine: ScriptedEngine,
    cache: StatementCache,
    statements: std::collections::HashMap<StatementId, String>,
    next_statement: u64,
    tx: Option<TxState>,
    next_tx: u64,
    closed: bool,
}

impl ScriptedConnection {
    fn live(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::ConnLost("scripted session is closed".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    fn tag(&self) -> EngineTag {
        self.engine.tag
    }

    fn tx_state(&self) -> Option<TxState> {
        self.tx
    }

    async fn begin(&mut self, isolation: Isolation) -> Result<(), EngineError> {
        self.live()?;
        if self.tx.is_some() {
            return Err(EngineError::TxInProgress);
        }
        self.engine.record(MockEvent::Begin);
        self.next_tx += 1;
        self.tx = Some(TxState {
            id: self.next_tx,
            isolation,
            depth: 1,
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        self.live()?;
        if self.tx.is_none() {
            return Err(EngineError::NoTx);
        }
        self.engine.record(MockEvent::Commit);
        self.tx = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        self.live()?;
        if self.tx.is_none() {
            return Err(EngineError::NoTx);
        }
        self.engine.record(MockEvent::Rollback);
        self.tx = None;
        Ok(())
    }

    async fn prepare(
        &mut self,
        fingerprint: &Fingerprint,
        sql: &str,
        arity: usize,
    ) -> Result<PreparedRef, EngineError> {
        self.live()?;
        if let Some((id, cached_arity)) = self.cache.lookup(fingerprint, sql) {
            self.cache.touch(fingerprint);
            return Ok(PreparedRef {
                id,
                arity: cached_arity,
            });
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
        self.live()?;
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
        self.engine.record(MockEvent::Execute {
            sql: sql.clone(),
            params: params.to_vec(),
        });
        if let Some((mut release, entered)) = self.engine.find_hold(&sql) {
            entered.store(true, Ordering::Release);
            let wait = async {
                while !*release.borrow() {
                    if release.changed().await.is_err() {
                        break;
                    }
                }
            };
            match deadline {
                Some(budget) => {
                    if timeout(budget, wait).await.is_err() {
                        return Err(EngineError::Timeout);
                    }
                }
                None => wait.await,
            }
        }
        if let Some(response) = self.engine.take_response(&sql) {
            return response;
        }
        let lowered = sql.trim_start().to_ascii_lowercase();
        if lowered.starts_with("select") || lowered.starts_with("with") {
            Ok(QueryOutcome::Rows {
                columns: Vec::new(),
                rows: Vec::new(),
            })
        } else {
            Ok(QueryOutcome::RowCount(0))
        }
    }

    async fn set_statement_timeout(
        &mut self,
        _timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        self.live()
    }

    async fn deallocate_all(&mut self) -> Result<(), EngineError> {
        for id in self.cache.clear() {
            self.statements.remove(&id);
        }
        self.live()
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.engine.record(MockEvent::Close);
            self.engine.live_connections.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
