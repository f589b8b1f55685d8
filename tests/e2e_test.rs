//! End-to-end tests for complete delivery workflows.
//!
//! Drives the HTTP API and the delivery worker together over the in-memory
//! environment: ingestion, fan-out, retries, dead-lettering, operator
//! replay and per-destination isolation.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState};
use courier_core::{JobStatus, Metric};
use courier_delivery::{CircuitState, Route};
use courier_testing::{StubReply, TestEnv};
use serde_json::{json, Value};
use tower::ServiceExt;

fn routed_env() -> TestEnv {
    let mut config = TestEnv::deterministic_config();
    config.routes = vec![
        Route::new("crm", "https://crm.example.test/hook"),
        Route::new("slack", "https://hooks.slack.example.test/T000").for_types(["alert"]),
    ];
    TestEnv::with_config(config).expect("failed to create test environment")
}

fn app_for(env: &TestEnv) -> Router {
    create_router(AppState::new(Arc::new(env.events.clone()), env.engine.clone()))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

/// Transient failures are absorbed inside one queue attempt.
#[tokio::test]
async fn flaky_destination_recovers_within_one_attempt() {
    let env = routed_env();
    let app = app_for(&env);
    env.transport.script(
        "crm",
        [StubReply::Status(503), StubReply::Status(503), StubReply::ConnectionReset],
    );

    let (status, ingested) = send(
        &app,
        "POST",
        "/events",
        Some(json!({"id": "evt-flaky", "type": "order.created", "body": {"total": 10}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(ingested["jobs_enqueued"], 1);

    env.run_delivery_cycle().await.unwrap();

    let (_, event) = send(&app, "GET", "/events/evt-flaky", None).await;
    let delivery = &event["deliveries"][0];
    assert_eq!(delivery["status"], "ok");
    assert_eq!(delivery["attempts"], 1);
    assert_eq!(env.transport.calls_to("crm"), 4);
    assert_eq!(env.metrics.get(Metric::CallRetry), 3);
    assert_eq!(env.metrics.get(Metric::OutboundOk), 1);
}

/// A dead destination is dead-lettered, replayed by an operator, and
/// delivered once it comes back.
#[tokio::test]
async fn dead_letter_replay_round_trip() {
    let env = routed_env();
    let app = app_for(&env);
    env.transport.always("crm", StubReply::Status(500));

    send(&app, "POST", "/events", Some(json!({"id": "evt-dead", "type": "order.created"}))).await;
    let id = env.jobs.all_jobs().await[0].id;

    let job = env.run_until_terminal(id, 20).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 8);

    let (_, circuit) = send(&app, "GET", "/circuits/crm", None).await;
    assert_eq!(circuit["state"], "OPEN");

    let (_, stats) = send(&app, "GET", "/deliveries/stats", None).await;
    assert_eq!(stats["failed"], 1);

    env.transport.always("crm", StubReply::Status(200));
    let (status, replayed) =
        send(&app, "POST", "/deliveries/replay", Some(json!({"ids": [id.0]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed["replayed"], 1);

    env.advance_time(Duration::from_secs(60));
    env.run_delivery_cycle().await.unwrap();

    let (_, job) = send(&app, "GET", &format!("/deliveries/{id}"), None).await;
    assert_eq!(job["status"], "ok");
    assert_eq!(job["attempts"], 1);

    let (_, stats) = send(&app, "GET", "/deliveries/stats", None).await;
    assert_eq!(stats, json!({"pending": 0, "retry": 0, "ok": 1, "failed": 0}));
}

/// One failing destination never holds back another.
#[tokio::test]
async fn failing_destination_does_not_block_healthy_one() {
    let env = routed_env();
    let app = app_for(&env);
    env.transport.always("crm", StubReply::Status(500));

    let (_, ingested) =
        send(&app, "POST", "/events", Some(json!({"id": "evt-alert", "type": "alert"}))).await;
    assert_eq!(ingested["jobs_enqueued"], 2);

    env.run_delivery_cycle().await.unwrap();

    let jobs = env.jobs.all_jobs().await;
    let crm = jobs.iter().find(|j| j.destination == "crm").unwrap();
    let slack = jobs.iter().find(|j| j.destination == "slack").unwrap();
    assert_eq!(crm.status, JobStatus::Retry);
    assert_eq!(slack.status, JobStatus::Ok);

    assert_eq!(env.engine.circuits().state("crm").await.state, CircuitState::Open);
    assert_eq!(env.engine.circuits().state("slack").await.state, CircuitState::Closed);

    let (_, stats) = send(&app, "GET", "/deliveries/stats", None).await;
    assert_eq!(stats["ok"], 1);
    assert_eq!(stats["retry"], 1);
}

/// Duplicate ingestion never produces a second delivery.
#[tokio::test]
async fn redelivered_event_is_delivered_once() {
    let env = routed_env();
    let app = app_for(&env);

    for _ in 0..3 {
        let (status, _) = send(
            &app,
            "POST",
            "/events",
            Some(json!({"id": "evt-once", "type": "order.created", "body": {"n": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    env.run_delivery_cycle().await.unwrap();
    env.run_delivery_cycle().await.unwrap();

    assert_eq!(env.transport.calls_to("crm"), 1);
    assert_eq!(env.metrics.get(Metric::EventsIngested), 1);
    assert_eq!(env.metrics.get(Metric::EventsDuplicate), 2);
}
