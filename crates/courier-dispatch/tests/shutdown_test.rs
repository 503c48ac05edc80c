//! Graceful shutdown with work in flight.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use courier_core::{JobKind, JobState};
use courier_dispatch::{
    shutdown::ShutdownStep, DispatchError, HandlerRegistry, LaneConfig, ShutdownOrchestrator,
    ShutdownOutcome,
};
use courier_testing::{GateHandler, JobBuilder, TestHarness};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_until_rejecting(orchestrator: &ShutdownOrchestrator, harness: &TestHarness) {
    while !orchestrator.is_requested() || harness.facade.is_accepting() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn in_flight_job_finishes_before_store_closes() -> Result<()> {
    let harness = TestHarness::builder().lanes(vec![LaneConfig::files().with_workers(1)]).build();
    let gate = Arc::new(GateHandler::new());
    let mut engine =
        harness.engine(HandlerRegistry::new().with_handler(JobKind::ProcessFile, gate.clone()));
    let job_id = harness.enqueue(JobBuilder::file("imports/large.csv")).await;

    engine.start().await?;
    gate.wait_until_entered().await;
    assert_eq!(harness.job(job_id).await.state, JobState::Active);

    let orchestrator = Arc::new(harness.orchestrator(engine));
    let shutdown = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.shutdown().await }
    });

    wait_until_rejecting(&orchestrator, &harness).await;
    let (lane, payload, options) = JobBuilder::file("imports/late.csv").parts();
    let rejected = harness.facade.enqueue(lane, payload, options).await;
    assert!(matches!(rejected, Err(DispatchError::QueueClosed)));

    // The handler is still running, so nothing past the drain has happened
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!shutdown.is_finished());
    assert!(!harness.store.is_closed());

    gate.open(1);
    let ShutdownOutcome::Completed(report) = tokio::time::timeout(WAIT, shutdown).await?? else {
        panic!("first shutdown request should run the sequence");
    };

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(harness.job(job_id).await.state, JobState::Completed);
    assert!(harness.store.is_closed());
    assert!(harness.facade.is_closed().await);
    assert_eq!(orchestrator.shutdown().await, ShutdownOutcome::AlreadyRequested);
    Ok(())
}

#[tokio::test]
async fn drain_timeout_is_reported_and_shutdown_continues() -> Result<()> {
    let harness = TestHarness::builder()
        .lanes(vec![LaneConfig::files().with_workers(1)])
        .drain_timeout(Duration::from_millis(50))
        .build();
    let gate = Arc::new(GateHandler::new());
    let mut engine =
        harness.engine(HandlerRegistry::new().with_handler(JobKind::ProcessFile, gate.clone()));
    let job_id = harness.enqueue(JobBuilder::file("imports/stuck.csv")).await;

    engine.start().await?;
    gate.wait_until_entered().await;

    let orchestrator = harness.orchestrator(engine);
    let ShutdownOutcome::Completed(report) = orchestrator.shutdown().await else {
        panic!("first shutdown request should run the sequence");
    };

    let failed: Vec<ShutdownStep> = report.failures().map(|step| step.step).collect();
    assert_eq!(failed, vec![ShutdownStep::DrainWorkers]);
    assert!(harness.store.is_closed());

    // Left active for stale-lease recovery after restart
    assert_eq!(harness.job(job_id).await.state, JobState::Active);
    Ok(())
}

#[tokio::test]
async fn idle_engine_shuts_down_cleanly() -> Result<()> {
    let harness = TestHarness::new();
    let mut engine = harness.engine(HandlerRegistry::new());
    engine.start().await?;

    let orchestrator = harness.orchestrator(engine);
    let ShutdownOutcome::Completed(report) = orchestrator.shutdown().await else {
        panic!("first shutdown request should run the sequence");
    };

    let steps: Vec<ShutdownStep> = report.steps.iter().map(|step| step.step).collect();
    assert_eq!(
        steps,
        vec![
            ShutdownStep::CloseListener,
            ShutdownStep::DrainWorkers,
            ShutdownStep::CloseQueue,
            ShutdownStep::CloseStore,
            ShutdownStep::GracePeriod,
        ]
    );
    assert!(report.is_clean());
    Ok(())
}
