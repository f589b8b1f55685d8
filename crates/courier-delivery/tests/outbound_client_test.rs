//! `post_json` against a real HTTP server.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, Metric, MetricsRegistry, TestClock};
use courier_delivery::{
    ratelimit::GENERIC_PROFILE, CircuitBreakerRegistry, CircuitConfig, ClientConfig,
    DeliveryError, HttpTransport, OutboundClient, PostJson, RateLimiter,
};
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn client() -> (OutboundClient, Arc<MetricsRegistry>) {
    let metrics = Arc::new(MetricsRegistry::new());
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let client = OutboundClient::new(
        Arc::new(HttpTransport::with_defaults().unwrap()),
        Arc::new(CircuitBreakerRegistry::new(
            CircuitConfig::default(),
            clock.clone(),
            metrics.clone(),
        )),
        Arc::new(RateLimiter::new(GENERIC_PROFILE, clock.clone(), metrics.clone())),
        metrics.clone(),
        clock,
        ClientConfig::default(),
    );
    (client, metrics)
}

#[tokio::test]
async fn posts_json_and_returns_parsed_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(header("x-team", "growth"))
        .and(body_json(json!({"text": "new lead"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "ts": "1.2"})))
        .expect(1)
        .mount(&server)
        .await;

    let (client, metrics) = client();
    let body = client
        .post_json(
            PostJson::new("slack", format!("{}/hook", server.uri()), json!({"text": "new lead"}))
                .header("x-team", "growth"),
        )
        .await
        .unwrap();

    assert_eq!(body, json!({"ok": true, "ts": "1.2"}));
    assert_eq!(metrics.get(Metric::OutboundAttempt), 1);
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, metrics) = client();
    let body = client.post_json(PostJson::new("crm", server.uri(), json!({}))).await.unwrap();

    assert_eq!(body, json!({}));
    assert_eq!(metrics.get(Metric::CallRetry), 2);
}

#[tokio::test]
async fn client_errors_fail_after_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("missing field email"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client();
    let err = client.post_json(PostJson::new("crm", server.uri(), json!({}))).await.unwrap_err();

    assert_eq!(err, DeliveryError::ClientError {
        status_code: 400,
        body: "missing field email".to_string(),
    });
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn exhausted_retries_return_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .expect(5)
        .mount(&server)
        .await;

    let (client, metrics) = client();
    let err = client.post_json(PostJson::new("voice", server.uri(), json!({}))).await.unwrap_err();

    assert_eq!(err.status(), Some(502));
    assert_eq!(metrics.get(Metric::OutboundAttempt), 5);
    assert_eq!(metrics.get(Metric::CircuitOpen), 1);
}

#[tokio::test]
async fn slow_destination_hits_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let (client, _) = client();
    let err = client
        .post_json(
            PostJson::new("voice", server.uri(), json!({}))
                .timeout(Duration::from_millis(50))
                .without_rate_limit(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "TIMEOUT");
}
