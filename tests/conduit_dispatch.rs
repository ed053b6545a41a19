//! Conduit dispatch pipeline: validation, deduplication, rate limiting,
//! ordered assembly, and per-query error slots.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "test code can panic"
)]

use std::collections::HashMap;
use std::sync::Arc;

use hydrogen::conduit::{
    AuthQueriesRequest, Conduit, ConduitError, Identity, QueriesRequest, QueryRequest, RejectAll,
    StaticTokens,
};
use hydrogen::dqm::{Dqm, Tier};
use hydrogen::engine::QueryOutcome;
use hydrogen::migrate::{QueriesTable, QueryDef};
use test_util::{memory_descriptor, ScriptedEngine};

fn table(defs: &[(i64, &str, Tier)]) -> QueriesTable {
    let mut table = QueriesTable::default();
    for (query_ref, sql, tier) in defs {
        table.insert(QueryDef {
            query_ref: *query_ref,
            name: format!("q{query_ref}"),
            sql: (*sql).to_owned(),
            tier: *tier,
            params: Vec::new(),
            transactional: false,
        });
    }
    table
}

async fn launch_conduit(engine: &ScriptedEngine, queries: QueriesTable) -> (Conduit, Dqm) {
    let dqm = Dqm::new(memory_descriptor("Acuranzo", 2), Arc::new(engine.clone()));
    dqm.publish_queries(queries);
    dqm.launch().await.expect("launch");
    let conduit = Conduit::new(
        HashMap::from([("Acuranzo".to_owned(), dqm.clone())]),
        Arc::new(RejectAll),
    );
    (conduit, dqm)
}

fn request(refs: &[i64]) -> QueriesRequest {
    QueriesRequest {
        database: "Acuranzo".to_owned(),
        queries: refs
            .iter()
            .map(|query_ref| QueryRequest {
                query_ref: *query_ref,
                params: None,
            })
            .collect(),
    }
}

#[tokio::test]
async fn duplicates_dedup_under_the_limit() {
    let engine = ScriptedEngine::sqlite();
    for n in [1, 2, 3] {
        engine.respond_once(
            &format!("SELECT {n}"),
            Ok(QueryOutcome::Rows {
                columns: vec!["v".to_owned()],
                rows: vec![vec![serde_json::json!(n)]],
            }),
        );
    }
    let (conduit, dqm) = launch_conduit(
        &engine,
        table(&[
            (1, "SELECT 1", Tier::Fast),
            (2, "SELECT 2", Tier::Fast),
            (3, "SELECT 3", Tier::Fast),
        ]),
    )
    .await;

    // Input [1, 2, 1, 3, 2]: canonical list [1, 2, 3], mapping [0, 1, 0, 2, 1].
    let response = conduit.queries(request(&[1, 2, 1, 3, 2])).await.expect("dispatch");
    assert_eq!(response.results.len(), 5);
    assert_eq!(response.results[0], response.results[2]);
    assert_eq!(response.results[1], response.results[4]);
    assert_eq!(response.results[0].query_ref, 1);
    assert_eq!(response.results[3].query_ref, 3);
    for slot in &response.results {
        assert!(slot.error.is_none(), "unexpected error: {slot:?}");
    }

    // Duplicate refs share one backend execution each.
    let executed = engine.executed();
    assert_eq!(executed.len(), 3);
    dqm.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn too_many_unique_refs_is_rate_limited_before_dispatch() {
    let engine = ScriptedEngine::sqlite();
    let defs: Vec<(i64, String)> = (1..=6).map(|n| (n, format!("SELECT {n}"))).collect();
    let mut queries = QueriesTable::default();
    for (query_ref, sql) in &defs {
        queries.insert(QueryDef {
            query_ref: *query_ref,
            name: format!("q{query_ref}"),
            sql: sql.clone(),
            tier: Tier::Fast,
            params: Vec::new(),
            transactional: false,
        });
    }
    let (conduit, dqm) = launch_conduit(&engine, queries).await;

    // [1,2,3,1,4,2,5,6] carries six unique refs against a limit of five.
    let error = conduit
        .queries(request(&[1, 2, 3, 1, 4, 2, 5, 6]))
        .await
        .expect_err("must be limited");
    assert_eq!(error, ConduitError::RateLimited { unique: 6, limit: 5 });
    assert_eq!(error.http_status(), 429);
    // Nothing was dispatched.
    assert!(engine.executed().is_empty());
    dqm.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn one_bad_ref_fails_in_place_only() {
    let engine = ScriptedEngine::sqlite();
    engine.respond_once(
        "SELECT 1",
        Ok(QueryOutcome::Rows {
            columns: vec!["v".to_owned()],
            rows: vec![vec![serde_json::json!(1)]],
        }),
    );
    let (conduit, dqm) = launch_conduit(&engine, table(&[(1, "SELECT 1", Tier::Fast)])).await;

    let response = conduit.queries(request(&[1, 999])).await.expect("dispatch");
    assert!(response.results[0].error.is_none());
    let error = response.results[1].error.as_ref().expect("error slot");
    assert_eq!(error.kind, "unknown_query_ref");
    dqm.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn whole_request_validation_failures() {
    let engine = ScriptedEngine::sqlite();
    let (conduit, dqm) = launch_conduit(&engine, QueriesTable::default()).await;

    let error = conduit
        .queries(QueriesRequest {
            database: "Nowhere".to_owned(),
            queries: vec![QueryRequest {
                query_ref: 1,
                params: None,
            }],
        })
        .await
        .expect_err("unknown database");
    assert!(matches!(error, ConduitError::UnknownDatabase(_)));
    assert_eq!(error.http_status(), 400);

    let error = conduit.queries(request(&[])).await.expect_err("empty list");
    assert!(matches!(error, ConduitError::BadRequest(_)));
    dqm.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn auth_queries_validates_before_dispatch_and_substitutes_identity() {
    let engine = ScriptedEngine::sqlite();
    engine.respond_once(
        "SELECT owner",
        Ok(QueryOutcome::Rows {
            columns: vec!["owner".to_owned()],
            rows: vec![vec![serde_json::json!("user-7")]],
        }),
    );
    let mut queries = QueriesTable::default();
    queries.insert(QueryDef {
        query_ref: 7,
        name: "owned".to_owned(),
        sql: "SELECT owner FROM things WHERE owner = ?".to_owned(),
        tier: Tier::Fast,
        params: vec!["identity.subject".to_owned()],
        transactional: false,
    });
    let dqm = Dqm::new(memory_descriptor("Acuranzo", 1), Arc::new(engine.clone()));
    dqm.publish_queries(queries);
    dqm.launch().await.expect("launch");
    let validator = StaticTokens::default().with_token(
        "good-token",
        Identity {
            subject: "user-7".to_owned(),
            claims: serde_json::Map::new(),
        },
    );
    let conduit = Conduit::new(
        HashMap::from([("Acuranzo".to_owned(), dqm.clone())]),
        Arc::new(validator),
    );

    let bad = conduit
        .auth_queries(AuthQueriesRequest {
            token: "wrong".to_owned(),
            database: "Acuranzo".to_owned(),
            queries: vec![QueryRequest {
                query_ref: 7,
                params: None,
            }],
        })
        .await
        .expect_err("bad token");
    assert_eq!(bad, ConduitError::AuthFailed);
    assert_eq!(bad.http_status(), 401);
    assert!(engine.executed().is_empty(), "nothing dispatched on auth failure");

    let response = conduit
        .auth_queries(AuthQueriesRequest {
            token: "good-token".to_owned(),
            database: "Acuranzo".to_owned(),
            queries: vec![QueryRequest {
                query_ref: 7,
                params: None,
            }],
        })
        .await
        .expect("authed dispatch");
    assert!(response.results[0].error.is_none());
    // The identity subject travelled as the bound parameter.
    let events = engine.events();
    let bound = events
        .iter()
        .find_map(|event| match event {
            test_util::MockEvent::Execute { sql, params } if sql.contains("SELECT owner") => {
                Some(params.clone())
            }
            _ => None,
        })
        .expect("executed");
    assert_eq!(
        bound,
        vec![hydrogen::engine::Param::Text("user-7".to_owned())]
    );
    dqm.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn alt_queries_requires_every_field() {
    let engine = ScriptedEngine::sqlite();
    let (conduit, dqm) = launch_conduit(&engine, QueriesTable::default()).await;
    let error = conduit
        .alt_queries(AuthQueriesRequest {
            token: String::new(),
            database: "Acuranzo".to_owned(),
            queries: vec![QueryRequest {
                query_ref: 1,
                params: None,
            }],
        })
        .await
        .expect_err("empty token");
    assert!(matches!(error, ConduitError::BadRequest(_)));
    dqm.shutdown(std::time::Duration::from_secs(1)).await;
}
