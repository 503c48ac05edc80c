//! Health and readiness endpoint tests.
//!
//! `/health` must answer even when the store is gone; `/ready` reflects the
//! store and the facade's accepting flag.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use courier_api::{create_router, AppState};
use courier_testing::TestHarness;
use serde_json::Value;
use tower::ServiceExt;

fn app(harness: &TestHarness) -> axum::Router {
    create_router(AppState::new(harness.facade.clone(), harness.clock_handle()))
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.expect("failed to make request");
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let json = serde_json::from_slice(&body).expect("response should be valid JSON");

    (status, json)
}

#[tokio::test]
async fn liveness_reports_healthy() {
    let harness = TestHarness::new();

    let (status, body) = get(app(&harness), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body.get("checks").is_none());
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn liveness_uses_the_injected_clock() {
    let harness = TestHarness::new();
    harness.clock.advance(Duration::from_secs(3600));
    let expected = courier_core::Clock::now_utc(&harness.clock);

    let (_, body) = get(app(&harness), "/health").await;

    let timestamp: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(body["timestamp"].clone()).unwrap();
    assert_eq!(timestamp, expected);
}

#[tokio::test]
async fn readiness_includes_store_status() {
    let harness = TestHarness::new();

    let (status, body) = get(app(&harness), "/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["store"]["status"], "up");
    assert!(body["checks"]["store"]["response_time_ms"].is_u64());
}

#[tokio::test]
async fn readiness_fails_when_store_is_unavailable() {
    let harness = TestHarness::new();
    harness.store.inject_store_error("connection refused").await;

    let (status, body) = get(app(&harness), "/ready").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["store"]["status"], "down");
    assert!(body["checks"]["store"]["message"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn readiness_fails_once_queue_stops_accepting() {
    let harness = TestHarness::new();
    harness.facade.stop_accepting();

    let (status, body) = get(app(&harness), "/ready").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["store"]["message"], "queue is shutting down");

    let (status, _) = get(app(&harness), "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn responses_carry_request_id() {
    let harness = TestHarness::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let response = app(&harness).oneshot(request).await.unwrap();

    let request_id = response.headers().get("X-Request-Id").expect("request id header");
    assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
}
