//! Event ingestion tests.
//!
//! Drives `POST /events` through the full router over the in-memory test
//! environment: idempotency, routing to jobs, signature gate, and error
//! mapping for bad input and storage failures.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, crypto::sign, AppState};
use courier_core::{JobStatus, Metric};
use courier_delivery::Route;
use courier_testing::TestEnv;
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

fn post_event(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

#[tokio::test]
async fn new_event_is_stored_and_routed() {
    let env = routed_env();
    let app = app_for(&env);

    let (status, body) = send(
        &app,
        post_event(&json!({
            "id": "evt-1",
            "type": "order.created",
            "path": "/orders",
            "body": {"order": 42}
        })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"id": "evt-1", "duplicate": false, "jobs_enqueued": 1}));
    assert_eq!(env.metrics.get(Metric::EventsIngested), 1);

    let jobs = env.jobs.all_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].destination, "crm");
    assert_eq!(jobs[0].event_id, "evt-1");
    assert_eq!(jobs[0].payload["body"], json!({"order": 42}));
}

#[tokio::test]
async fn alert_fans_out_to_every_matching_route() {
    let env = routed_env();
    let app = app_for(&env);

    let (status, body) =
        send(&app, post_event(&json!({"id": "evt-alert", "type": "alert", "body": {}}))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["jobs_enqueued"], 2);
}

#[tokio::test]
async fn duplicate_event_keeps_first_body_and_enqueues_nothing() {
    let env = routed_env();
    let app = app_for(&env);

    send(&app, post_event(&json!({"id": "evt-dup", "type": "order.created", "body": {"v": 1}})))
        .await;
    let (status, body) = send(
        &app,
        post_event(&json!({"id": "evt-dup", "type": "order.created", "body": {"v": 2}})),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["jobs_enqueued"], 0);
    assert_eq!(env.metrics.get(Metric::EventsDuplicate), 1);
    assert_eq!(env.jobs.all_jobs().await.len(), 1);

    let request = Request::builder().uri("/events/evt-dup").body(Body::empty()).unwrap();
    let (status, event) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["body"], json!({"v": 1}));
    assert_eq!(event["deliveries"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn malformed_events_are_rejected() {
    let env = routed_env();
    let app = app_for(&env);

    let request = Request::builder()
        .method("POST")
        .uri("/events")
        .body(Body::from("not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_INPUT");

    let (status, body) = send(&app, post_event(&json!({"id": "", "type": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_INPUT");

    assert!(env.events.is_empty().await);
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let env = routed_env();
    let app = app_for(&env);

    let filler = "x".repeat(courier_api::handlers::events::MAX_PAYLOAD_BYTES);
    let (status, body) =
        send(&app, post_event(&json!({"id": "big", "type": "x", "body": filler}))).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn storage_failure_surfaces_as_server_error() {
    let env = routed_env();
    let app = app_for(&env);
    env.events.inject_error("disk full").await;

    let (status, body) =
        send(&app, post_event(&json!({"id": "evt-lost", "type": "order.created"}))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "STORAGE_ERROR");
    assert!(env.jobs.all_jobs().await.is_empty());
}

#[tokio::test]
async fn redelivery_enqueues_jobs_lost_to_a_failed_enqueue() {
    let env = routed_env();
    let app = app_for(&env);
    env.jobs.inject_enqueue_error("connection reset").await;
    let event = json!({"id": "evt-1", "type": "alert", "body": {"n": 1}});

    let (status, _) = send(&app, post_event(&event)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(env.jobs.all_jobs().await.is_empty());

    let (status, body) = send(&app, post_event(&event)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"id": "evt-1", "duplicate": true, "jobs_enqueued": 2}));

    let mut destinations: Vec<_> =
        env.jobs.all_jobs().await.into_iter().map(|job| job.destination).collect();
    destinations.sort();
    assert_eq!(destinations, ["crm", "slack"]);

    let (_, body) = send(&app, post_event(&event)).await;
    assert_eq!(body["jobs_enqueued"], 0);
    assert_eq!(env.jobs.all_jobs().await.len(), 2);
}

#[tokio::test]
async fn signed_ingestion_requires_valid_signature() {
    let env = routed_env();
    let state = AppState::new(Arc::new(env.events.clone()), env.engine.clone())
        .with_signing_secret("shared-secret");
    let app = create_router(state);
    let payload = json!({"id": "evt-signed", "type": "order.created"}).to_string();

    let unsigned = Request::builder()
        .method("POST")
        .uri("/events")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, body) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let wrong = Request::builder()
        .method("POST")
        .uri("/events")
        .header("x-courier-signature", sign(payload.as_bytes(), "other-secret").unwrap())
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(env.events.is_empty().await);

    let signed = Request::builder()
        .method("POST")
        .uri("/events")
        .header("x-courier-signature", sign(payload.as_bytes(), "shared-secret").unwrap())
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = send(&app, signed).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["duplicate"], false);
}

#[tokio::test]
async fn ingested_event_is_delivered_by_the_worker() {
    let env = routed_env();
    let app = app_for(&env);

    send(&app, post_event(&json!({"id": "evt-e2e", "type": "order.created", "body": {}}))).await;
    env.run_delivery_cycle().await.unwrap();

    let jobs = env.jobs.all_jobs().await;
    assert_eq!(jobs[0].status, JobStatus::Ok);

    let request =
        Request::builder().uri(format!("/deliveries/{}", jobs[0].id)).body(Body::empty()).unwrap();
    let (status, job) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "ok");
    assert_eq!(job["attempts"], 1);

    let calls = env.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].headers.get("x-courier-event-id").map(String::as_str), Some("evt-e2e"));
}
