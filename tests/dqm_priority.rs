//! Queue semantics: strict tier priority, FIFO, bounded capacity,
//! cancellation, and draining.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "test code can panic"
)]

use std::sync::Arc;
use std::time::Duration;

use hydrogen::dqm::{CancelOutcome, Dqm, DqmState, QueueError, Tier, WorkError, WorkRequest};
use hydrogen::engine::EngineError;
use test_util::{memory_descriptor, ScriptedEngine};

fn request(tier: Tier, sql: &str) -> WorkRequest {
    WorkRequest::new(0, tier, sql, Vec::new())
}

#[tokio::test]
async fn one_worker_observes_strict_priority_order() {
    let engine = ScriptedEngine::sqlite();
    let gate = engine.hold("GATE");
    let dqm = Dqm::new(memory_descriptor("Solo", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let blocker = dqm.submit(request(Tier::Cached, "SELECT 'GATE'")).expect("gate");
    gate.entered_wait().await;

    // Enqueued in worst-to-best order while the only worker is busy.
    let a = dqm.submit(request(Tier::Slow, "SELECT 'A'")).expect("a");
    let b = dqm.submit(request(Tier::Medium, "SELECT 'B'")).expect("b");
    let c = dqm.submit(request(Tier::Fast, "SELECT 'C'")).expect("c");
    let d = dqm.submit(request(Tier::Cached, "SELECT 'D'")).expect("d");
    gate.release();

    for submission in [a, b, c, d] {
        submission.receiver.await.expect("delivered").expect("ok");
    }
    blocker.receiver.await.expect("delivered").expect("ok");

    let executed = engine.executed();
    assert_eq!(
        executed,
        vec![
            "SELECT 'GATE'",
            "SELECT 'D'",
            "SELECT 'C'",
            "SELECT 'B'",
            "SELECT 'A'",
        ]
    );
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn full_queue_rejects_submissions_without_blocking() {
    let engine = ScriptedEngine::sqlite();
    let gate = engine.hold("GATE");
    let mut descriptor = memory_descriptor("Tight", 1);
    descriptor.queue_capacity = 2;
    let dqm = Dqm::new(descriptor, Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let blocker = dqm.submit(request(Tier::Fast, "SELECT 'GATE'")).expect("gate");
    gate.entered_wait().await;
    dqm.submit(request(Tier::Fast, "SELECT 1")).expect("first fits");
    dqm.submit(request(Tier::Fast, "SELECT 2")).expect("second fits");
    assert_eq!(
        dqm.submit(request(Tier::Fast, "SELECT 3")).map(|_| ()),
        Err(QueueError::QueueFull)
    );
    // Tiers are bounded independently.
    dqm.submit(request(Tier::Slow, "SELECT 4")).expect("slow fits");

    gate.release();
    blocker.receiver.await.expect("delivered").expect("ok");
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cancellation_is_observed_at_dequeue() {
    let engine = ScriptedEngine::sqlite();
    let gate = engine.hold("GATE");
    let dqm = Dqm::new(memory_descriptor("Cancels", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let blocker = dqm.submit(request(Tier::Fast, "SELECT 'GATE'")).expect("gate");
    gate.entered_wait().await;
    let victim = dqm.submit(request(Tier::Fast, "SELECT 'VICTIM'")).expect("victim");

    assert_eq!(dqm.cancel(victim.id), CancelOutcome::Cancelled);
    assert_eq!(dqm.cancel(blocker.id), CancelOutcome::AlreadyStarted);
    assert_eq!(dqm.cancel(u64::MAX), CancelOutcome::NotFound);

    gate.release();
    assert_eq!(
        victim.receiver.await.expect("delivered"),
        Err(WorkError::Cancelled)
    );
    // The cancelled item never reached the engine.
    assert!(!engine.executed().iter().any(|sql| sql.contains("VICTIM")));
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn expired_deadline_is_reported_as_timeout() {
    let engine = ScriptedEngine::sqlite();
    let gate = engine.hold("SLEEPY");
    let dqm = Dqm::new(memory_descriptor("Deadlines", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let mut slow = request(Tier::Fast, "SELECT 'SLEEPY'");
    slow.deadline = Some(Duration::from_millis(50));
    let submission = dqm.submit(slow).expect("submit");
    assert_eq!(
        submission.receiver.await.expect("delivered"),
        Err(WorkError::Engine(EngineError::Timeout))
    );
    gate.release();
    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn draining_cancels_queued_work_and_lands() {
    let engine = ScriptedEngine::sqlite();
    let gate = engine.hold("GATE");
    let dqm = Dqm::new(memory_descriptor("Drains", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");
    assert_eq!(dqm.state(), DqmState::Running);

    let blocker = dqm.submit(request(Tier::Fast, "SELECT 'GATE'")).expect("gate");
    gate.entered_wait().await;
    let queued = dqm.submit(request(Tier::Fast, "SELECT 'QUEUED'")).expect("queued");

    let drainer = {
        let dqm = dqm.clone();
        tokio::spawn(async move { dqm.shutdown(Duration::from_secs(2)).await })
    };
    // Enqueued-but-unstarted work is cancelled immediately.
    assert_eq!(
        queued.receiver.await.expect("delivered"),
        Err(WorkError::Cancelled)
    );
    // In-flight work is allowed to finish inside the grace window.
    gate.release();
    blocker.receiver.await.expect("delivered").expect("ok");
    drainer.await.expect("join");

    assert_eq!(dqm.state(), DqmState::Landed);
    assert_eq!(
        dqm.submit(request(Tier::Fast, "SELECT 'LATE'")).map(|_| ()),
        Err(QueueError::NotRunning)
    );
    // Workers closed their connections on the way out.
    assert_eq!(engine.live_connections(), 0);
}

#[tokio::test]
async fn status_reports_state_and_depths() {
    let engine = ScriptedEngine::sqlite();
    let gate = engine.hold("GATE");
    let dqm = Dqm::new(memory_descriptor("Status", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let blocker = dqm.submit(request(Tier::Cached, "SELECT 'GATE'")).expect("gate");
    gate.entered_wait().await;
    dqm.submit(request(Tier::Slow, "SELECT 1")).expect("slow");
    dqm.submit(request(Tier::Slow, "SELECT 2")).expect("slow");
    dqm.submit(request(Tier::Fast, "SELECT 3")).expect("fast");

    let status = dqm.status();
    assert_eq!(status.state, DqmState::Running);
    assert_eq!(status.depths.slow, 2);
    assert_eq!(status.depths.fast, 1);
    assert_eq!(status.workers.len(), 1);

    gate.release();
    blocker.receiver.await.expect("delivered").expect("ok");
    dqm.shutdown(Duration::from_secs(1)).await;
}
