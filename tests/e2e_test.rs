//! End-to-end tests: HTTP producer, dispatch engine and ordered shutdown
//! wired together over the in-memory store.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, serve, AppState};
use courier_core::{JobId, JobKind, JobState};
use courier_dispatch::{
    shutdown::ListenerHandle, HandlerError, HandlerRegistry, LaneConfig, ShutdownOutcome,
};
use courier_testing::{gaps, Invariants, ScriptedHandler, TestHarness};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(10);

fn router(harness: &TestHarness) -> Router {
    create_router(AppState::new(harness.facade.clone(), harness.clock_handle()))
}

async fn post_job(app: Router, lane: &str, payload: Value) -> JobId {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/lanes/{lane}/jobs"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&json!({ "payload": payload })).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    body["job_id"].as_str().unwrap().parse().unwrap()
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn sms(recipient: &str) -> Value {
    json!({"kind": "send_message", "recipient": recipient, "content": "Your parcel has shipped"})
}

/// Jobs submitted over HTTP are dispatched, throttled, and visible as
/// completed through the API.
#[tokio::test]
async fn http_jobs_are_dispatched_and_throttled() -> Result<()> {
    let harness = TestHarness::builder()
        .lanes(vec![LaneConfig::bulk_sms().with_workers(1), LaneConfig::files().with_workers(2)])
        .build();
    let sms_handler = Arc::new(ScriptedHandler::succeeding(harness.clock_handle()));
    let file_handler = Arc::new(ScriptedHandler::succeeding(harness.clock_handle()));
    let mut engine = harness.engine(
        HandlerRegistry::new()
            .with_handler(JobKind::SendMessage, sms_handler.clone())
            .with_handler(JobKind::ProcessFile, file_handler.clone()),
    );

    let mut message_ids = Vec::new();
    for recipient in ["+15550000001", "+15550000002", "+15550000003"] {
        message_ids.push(post_job(router(&harness), "bulk-sms", sms(recipient)).await);
    }
    let file_id = post_job(
        router(&harness),
        "files",
        json!({"kind": "process_file", "file_ref": "imports/contacts.csv", "operation": "import"}),
    )
    .await;

    engine.start().await?;
    for job_id in message_ids.iter().chain(std::iter::once(&file_id)) {
        harness.wait_for_state(*job_id, JobState::Completed, WAIT).await?;
    }
    engine.shutdown().await?;

    let instants: Vec<_> = sms_handler.invocations().await.iter().map(|call| call.at).collect();
    assert_eq!(instants.len(), 3);
    Invariants::spaced_by(&gaps(&instants), Duration::from_secs(20))?;
    assert_eq!(file_handler.call_count().await, 1);

    let (status, body) = get_json(router(&harness), "/lanes/bulk-sms/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["completed"], 3);
    assert_eq!(body["waiting"], 0);

    let (status, body) = get_json(router(&harness), &format!("/jobs/{file_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["attempts"], 1);
    Ok(())
}

/// A transient failure is retried and the final error stays visible on the
/// failed record.
#[tokio::test]
async fn exhausted_job_reports_last_error() -> Result<()> {
    let harness = TestHarness::builder().lanes(vec![LaneConfig::files().with_workers(1)]).build();
    let handler = Arc::new(ScriptedHandler::failing(
        harness.clock_handle(),
        HandlerError::transient("storage bucket offline"),
    ));
    let mut engine =
        harness.engine(HandlerRegistry::new().with_handler(JobKind::ProcessFile, handler.clone()));

    let job_id = post_job(
        router(&harness),
        "files",
        json!({"kind": "process_file", "file_ref": "exports/q3.csv", "operation": "export"}),
    )
    .await;

    engine.start().await?;
    harness.wait_for_state(job_id, JobState::Failed, WAIT).await?;
    engine.shutdown().await?;

    let (_, body) = get_json(router(&harness), &format!("/jobs/{job_id}")).await;
    assert_eq!(body["state"], "failed");
    assert_eq!(body["attempts"], 3);
    assert_eq!(body["last_error"], "transient failure: storage bucket offline");
    assert_eq!(handler.call_count().await, 3);
    Ok(())
}

/// Shutdown stops the listener, drains the engine and closes the queue; the
/// stored jobs survive for the next process.
#[tokio::test]
async fn shutdown_stops_listener_and_engine() -> Result<()> {
    let harness = TestHarness::new();
    let handler = Arc::new(ScriptedHandler::succeeding(harness.clock_handle()));
    let mut engine =
        harness.engine(HandlerRegistry::new().with_handler(JobKind::SendMessage, handler.clone()));
    engine.start().await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let token = token.clone();
        let state = AppState::new(harness.facade.clone(), harness.clock_handle());
        async move { serve(listener, state, token).await.map_err(anyhow::Error::from) }
    });

    let job_id = post_job(router(&harness), "bulk-sms", sms("+15550000009")).await;
    harness.wait_for_state(job_id, JobState::Completed, WAIT).await?;

    let orchestrator = harness
        .orchestrator(engine)
        .with_listener(ListenerHandle { token: token.clone(), task })
        .with_grace_period(Duration::ZERO);

    let ShutdownOutcome::Completed(report) = orchestrator.shutdown().await else {
        panic!("first shutdown should run the sequence");
    };

    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures().collect::<Vec<_>>());
    assert!(token.is_cancelled());
    assert!(harness.facade.is_closed().await);
    assert!(harness.store.is_closed());
    assert_eq!(harness.store.job(job_id).await.map(|job| job.state), Some(JobState::Completed));

    let (status, _) = get_json(router(&harness), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
