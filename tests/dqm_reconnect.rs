//! Worker reconnect behaviour: bounded backoff, no duplicate side effects,
//! and draining the item when the backend stays away.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "test code can panic"
)]

use std::sync::Arc;
use std::time::Duration;

use hydrogen::dqm::{Dqm, Tier, WorkError, WorkRequest};
use hydrogen::engine::{EngineError, QueryOutcome};
use test_util::{memory_descriptor, MockEvent, ScriptedEngine};

#[tokio::test(start_paused = true)]
async fn lost_connection_reconnects_without_duplicate_side_effects() {
    let engine = ScriptedEngine::sqlite();
    // First execution of the guarded INSERT dies mid-flight; the retry on
    // the fresh connection succeeds via the default response.
    engine.respond_once(
        "INSERT INTO audit",
        Err(EngineError::ConnLost("scripted drop".to_owned())),
    );
    let dqm = Dqm::new(memory_descriptor("Audit", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let mut request = WorkRequest::new(
        42,
        Tier::Medium,
        "INSERT INTO audit (line) VALUES (?)",
        vec![hydrogen::engine::Param::Text("boom".to_owned())],
    );
    request.transactional = true;
    let submission = dqm.submit(request).expect("submit");
    let outcome = submission.receiver.await.expect("delivered").expect("ok");
    assert_eq!(outcome, QueryOutcome::RowCount(0));

    // One reconnect on top of the launch connection.
    assert_eq!(engine.connects(), 2);

    let events = engine.events();
    let executes = events
        .iter()
        .filter(|e| matches!(e, MockEvent::Execute { sql, .. } if sql.contains("INSERT INTO audit")))
        .count();
    assert_eq!(executes, 2, "one failed attempt, one retry");
    // The first attempt's transaction was never committed; exactly one
    // commit exists and it happens after the reconnect.
    let commits = events.iter().filter(|e| matches!(e, MockEvent::Commit)).count();
    assert_eq!(commits, 1);
    let second_connect = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, MockEvent::Connect))
        .nth(1)
        .map(|(at, _)| at)
        .expect("reconnect event");
    let commit_at = events
        .iter()
        .position(|e| matches!(e, MockEvent::Commit))
        .expect("commit event");
    assert!(commit_at > second_connect);

    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_five_tries_and_drains_the_item() {
    let engine = ScriptedEngine::sqlite();
    engine.respond_once(
        "SELECT doomed",
        Err(EngineError::ConnLost("scripted drop".to_owned())),
    );
    let dqm = Dqm::new(memory_descriptor("Doomed", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");
    // Every reconnect attempt is refused.
    engine.fail_connects(5);

    let submission = dqm
        .submit(WorkRequest::new(7, Tier::Fast, "SELECT doomed", Vec::new()))
        .expect("submit");
    let result = submission.receiver.await.expect("delivered");
    assert!(matches!(
        result,
        Err(WorkError::Engine(EngineError::ConnLost(_)))
    ));
    // Launch connection plus five refused attempts.
    assert_eq!(engine.connects(), 6);

    dqm.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn conflicts_are_retried_exactly_once() {
    let engine = ScriptedEngine::sqlite();
    engine.respond_once(
        "UPDATE counters",
        Err(EngineError::Conflict("scripted deadlock".to_owned())),
    );
    let dqm = Dqm::new(memory_descriptor("Counters", 1), Arc::new(engine.clone()));
    dqm.launch().await.expect("launch");

    let submission = dqm
        .submit(WorkRequest::new(
            9,
            Tier::Medium,
            "UPDATE counters SET n = n + 1",
            Vec::new(),
        ))
        .expect("submit");
    submission.receiver.await.expect("delivered").expect("retry succeeded");
    assert_eq!(
        engine
            .executed()
            .iter()
            .filter(|sql| sql.contains("UPDATE counters"))
            .count(),
        2
    );

    // A second conflict in a row surfaces after the single retry.
    engine.respond_once(
        "UPDATE counters",
        Err(EngineError::Conflict("scripted deadlock".to_owned())),
    );
    engine.respond_once(
        "UPDATE counters",
        Err(EngineError::Conflict("scripted deadlock".to_owned())),
    );
    let submission = dqm
        .submit(WorkRequest::new(
            9,
            Tier::Medium,
            "UPDATE counters SET n = n + 1",
            Vec::new(),
        ))
        .expect("submit");
    let result = submission.receiver.await.expect("delivered");
    assert!(matches!(
        result,
        Err(WorkError::Engine(EngineError::Conflict(_)))
    ));

    dqm.shutdown(Duration::from_secs(1)).await;
}
