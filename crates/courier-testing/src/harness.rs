//! In-memory dispatch environment for integration tests.
//!
//! Wires an [`InMemoryJobStore`], a [`QueueFacade`] and engine configuration
//! around one shared [`TestClock`], so tests can enqueue through the real
//! facade, run the real engine and inspect the stored records.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use courier_core::{Clock, Job, JobId, JobState, PrunePolicy, TestClock};
use courier_dispatch::{
    storage::memory::InMemoryJobStore, DispatchEngine, EngineConfig, HandlerRegistry, LaneConfig,
    QueueFacade, RetryPolicy, ShutdownOrchestrator,
};
use tracing::debug;

use crate::fixtures::JobBuilder;

/// Builder for [`TestHarness`].
#[derive(Debug, Clone)]
pub struct TestHarnessBuilder {
    config: EngineConfig,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig {
                // Single worker per lane for determinism
                lanes: vec![LaneConfig::bulk_sms().with_workers(1), LaneConfig::files().with_workers(1)],
                poll_interval: Duration::from_millis(100),
                store_error_backoff: Duration::from_millis(500),
                maintenance_interval: None,
                ..EngineConfig::default()
            },
        }
    }
}

impl TestHarnessBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configured lanes.
    #[must_use]
    pub fn lanes(mut self, lanes: Vec<LaneConfig>) -> Self {
        self.config.lanes = lanes;
        self
    }

    /// Sets the idle poll interval (default: 100ms of test time).
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sets the handler timeout.
    #[must_use]
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout = timeout;
        self
    }

    /// Sets the drain window used by engine shutdown (default: 5s).
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Sets the retry policy. Its `max_attempts` also becomes the facade's
    /// default attempt ceiling.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Builds the harness.
    pub fn build(self) -> TestHarness {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryJobStore::new(Arc::new(clock.clone())));
        let facade = Arc::new(
            QueueFacade::new(store.clone(), PrunePolicy::default())
                .with_default_max_attempts(self.config.retry_policy.max_attempts),
        );

        TestHarness { clock, store, facade, config: self.config }
    }
}

/// In-memory store, facade and clock shared by one test.
pub struct TestHarness {
    /// Deterministic clock shared by every component
    pub clock: TestClock,
    /// Backing store
    pub store: Arc<InMemoryJobStore>,
    /// Producer-facing API over `store`
    pub facade: Arc<QueueFacade>,
    config: EngineConfig,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Harness with one worker per default lane.
    pub fn new() -> Self {
        TestHarnessBuilder::default().build()
    }

    /// Starts a builder.
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// The clock as the trait object components take.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Engine configuration used by [`Self::engine`].
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates an engine over the harness store.
    ///
    /// # Panics
    ///
    /// Panics if the builder produced an invalid configuration.
    pub fn engine(&self, registry: HandlerRegistry) -> DispatchEngine {
        DispatchEngine::new(self.store.clone(), registry, self.config.clone(), self.clock_handle())
            .expect("harness engine configuration should be valid")
    }

    /// Shutdown orchestrator over the harness facade and store.
    pub fn orchestrator(&self, engine: DispatchEngine) -> ShutdownOrchestrator {
        ShutdownOrchestrator::new(self.facade.clone(), self.store.clone(), self.clock_handle())
            .with_engine(engine)
    }

    /// Enqueues through the facade.
    ///
    /// # Panics
    ///
    /// Panics if the facade rejects the job.
    pub async fn enqueue(&self, job: JobBuilder) -> JobId {
        let (lane, payload, options) = job.parts();
        self.facade.enqueue(lane, payload, options).await.expect("harness enqueue should succeed")
    }

    /// Reads a stored job.
    ///
    /// # Panics
    ///
    /// Panics if the job does not exist.
    pub async fn job(&self, job_id: JobId) -> Job {
        self.store.job(job_id).await.expect("job should exist in harness store")
    }

    /// Waits, in real time, until the job reaches `state`.
    ///
    /// # Errors
    ///
    /// Returns error if `timeout` elapses first or the job disappears.
    pub async fn wait_for_state(&self, job_id: JobId, state: JobState, timeout: Duration) -> Result<Job> {
        self.wait_for(job_id, timeout, |job| job.state == state).await
    }

    /// Waits, in real time, until the job is completed or failed.
    ///
    /// # Errors
    ///
    /// Returns error if `timeout` elapses first or the job disappears.
    pub async fn wait_until_terminal(&self, job_id: JobId, timeout: Duration) -> Result<Job> {
        self.wait_for(job_id, timeout, |job| job.state.is_terminal()).await
    }

    async fn wait_for(
        &self,
        job_id: JobId,
        timeout: Duration,
        done: impl Fn(&Job) -> bool,
    ) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let Some(job) = self.store.job(job_id).await else {
                bail!("job {job_id} no longer exists");
            };
            if done(&job) {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("job {job_id} still {} after {timeout:?}", job.state);
            }

            debug!(job_id = %job_id, state = %job.state, "waiting for job");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}
