//! Work items and their life on a queue.
//!
//! A work item lives on exactly one queue until dequeued; after dequeue it
//! is owned by exactly one worker until completion or cancellation. The
//! response travels back over a oneshot channel owned by the submitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::engine::{EngineError, Param, QueryOutcome};

/// Default wall-clock budget for a work item without an explicit deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Queue tiers, in ascending dequeue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Long-running work: reports, migrations.
    Slow,
    /// The default tier.
    #[default]
    Medium,
    /// Interactive queries.
    Fast,
    /// Hot-path lookups.
    Cached,
}

impl Tier {
    /// Tiers in strict dequeue-priority order, highest first.
    pub const PRIORITY: [Self; 4] = [Self::Cached, Self::Fast, Self::Medium, Self::Slow];

    /// Stable queue index for this tier.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Slow => 0,
            Self::Medium => 1,
            Self::Fast => 2,
            Self::Cached => 3,
        }
    }

    /// Lowercase name, as used in migration metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
            Self::Cached => "cached",
        }
    }

    /// Parse a tier name from migration metadata.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "slow" => Some(Self::Slow),
            "medium" => Some(Self::Medium),
            "fast" => Some(Self::Fast),
            "cached" => Some(Self::Cached),
            _ => None,
        }
    }
}

/// Errors returned by queue operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The selected tier queue is at capacity.
    #[error("queue is full")]
    QueueFull,
    /// The item was cancelled before execution started.
    #[error("work item cancelled")]
    Cancelled,
    /// The queue manager is not accepting submissions.
    #[error("queue manager is not running")]
    NotRunning,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The cancel flag was set; the worker will drain the item at dequeue.
    Cancelled,
    /// No queued item carries this id.
    NotFound,
    /// A worker already started executing the item.
    AlreadyStarted,
}

/// Error slot delivered over a work item's response channel.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkError {
    /// The backend reported an error.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The item was cancelled before execution started.
    #[error("work item cancelled")]
    Cancelled,
}

/// Per-item retry policy, applied by the worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// How many times a `Conflict` is retried before surfacing.
    pub conflict_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            conflict_retries: 1,
        }
    }
}

/// A query submission, before it becomes a queued work item.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    /// Query reference the SQL was resolved from.
    pub query_ref: i64,
    /// Queue tier declared by the query's record.
    pub tier: Tier,
    /// Resolved SQL text.
    pub sql: String,
    /// Bound parameter values.
    pub params: Vec<Param>,
    /// Whether to wrap execution in a transaction.
    pub transactional: bool,
    /// Wall-clock budget; [`DEFAULT_DEADLINE`] when absent.
    pub deadline: Option<Duration>,
    /// Conflict retry policy.
    pub retry: RetryPolicy,
}

impl WorkRequest {
    /// Request with the default tier, deadline, and retry policy.
    #[must_use]
    pub fn new(query_ref: i64, tier: Tier, sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            query_ref,
            tier,
            sql: sql.into(),
            params,
            transactional: false,
            deadline: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// What the worker should run for one item.
#[derive(Debug)]
pub(crate) enum Payload {
    /// A single query, prepared through the statement cache.
    Query {
        sql: String,
        params: Vec<Param>,
        transactional: bool,
    },
    /// A migration batch: statements run in one transaction with the
    /// statement timeout lifted. Lead worker only.
    Batch { statements: Vec<String> },
}

/// A queued unit of work.
#[derive(Debug)]
pub(crate) struct WorkItem {
    pub id: u64,
    pub query_ref: i64,
    pub tier: Tier,
    pub payload: Payload,
    pub deadline: Instant,
    pub retry: RetryPolicy,
    pub lead_only: bool,
    pub cancel: Arc<AtomicBool>,
    pub started: Arc<AtomicBool>,
    pub responder: oneshot::Sender<Result<QueryOutcome, WorkError>>,
}

impl WorkItem {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Deliver the result; the submitter may have gone away, which is fine.
    pub(crate) fn respond(self, result: Result<QueryOutcome, WorkError>) {
        let _ = self.responder.send(result);
    }
}

/// Handle returned to the submitter.
#[derive(Debug)]
pub struct Submission {
    /// Item id, usable with cancel.
    pub id: u64,
    /// Receives the result exactly once.
    pub receiver: oneshot::Receiver<Result<QueryOutcome, WorkError>>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn priority_order_is_cached_first() {
        assert_eq!(
            Tier::PRIORITY,
            [Tier::Cached, Tier::Fast, Tier::Medium, Tier::Slow]
        );
    }

    #[rstest]
    #[case("cached", Some(Tier::Cached))]
    #[case("Fast", Some(Tier::Fast))]
    #[case("MEDIUM", Some(Tier::Medium))]
    #[case("slow", Some(Tier::Slow))]
    #[case("bulk", None)]
    fn tier_parsing(#[case] input: &str, #[case] expected: Option<Tier>) {
        assert_eq!(Tier::parse(input), expected);
    }

    #[rstest]
    fn tier_indices_are_distinct() {
        let mut seen = [false; 4];
        for tier in Tier::PRIORITY {
            assert!(!seen[tier.index()]);
            seen[tier.index()] = true;
        }
    }
}
