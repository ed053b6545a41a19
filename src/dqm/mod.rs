//! Database queue managers: per-database priority queues plus worker pool.
//!
//! One [`Dqm`] exists per configured database. Submissions land on one of
//! four bounded tier queues and are served by workers that each own a live
//! engine connection. The supervisor drives the lifecycle and is the only
//! place migrations enter the execution path.

mod queues;
mod supervisor;
mod work;
mod worker;

pub use supervisor::{
    Dqm, DqmState, DqmStatus, LaunchError, TierDepths, WorkerStatus, DEFAULT_DRAIN_GRACE,
};
pub use work::{
    CancelOutcome, QueueError, RetryPolicy, Submission, Tier, WorkError, WorkRequest,
    DEFAULT_DEADLINE,
};
pub use worker::WorkerState;
