//! Dispatch engine: per-lane worker pools plus periodic maintenance.
//!
//! The engine owns everything workers share: the rate limiter, the per-lane
//! lease windows, the handler registry and the counters. Starting it spawns
//! the configured workers for every lane and a maintenance task that prunes
//! terminal jobs and requeues leases abandoned by a dead process.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ DispatchEngine │──▶│ Worker Pool  │──▶│ JobHandler   │
//! └────────────────┘   └──────────────┘   └──────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌───────────────┐    ┌──────────────┐
//! │ Maintenance   │    │ RateLimiter  │
//! │ prune/requeue │    │ LeaseWindow  │
//! └───────────────┘    └──────────────┘
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use courier_core::{models::cutoff_before, Clock, Lane, PrunePolicy};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DispatchError, Result},
    handler::HandlerRegistry,
    lease::LeaseWindow,
    rate_limit::RateLimiter,
    retry::RetryPolicy,
    storage::JobStore,
    worker::{DispatchWorker, JobOutcome, WorkerContext, WorkerSettings},
    worker_pool::{LaneWorkers, WorkerPool},
};

/// Interval between two sends on the `bulk-sms` lane.
pub const DEFAULT_BULK_SMS_INTERVAL: Duration = Duration::from_secs(20);

/// Per-lane worker and throttling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneConfig {
    /// Lane the workers lease from.
    pub lane: Lane,

    /// Number of concurrent workers.
    pub worker_count: usize,

    /// Minimum spacing between handler invocations. `None` disables throttling.
    pub rate_limit_interval: Option<Duration>,

    /// Cap on leases per rolling minute. `None` disables the cap.
    pub max_leases_per_minute: Option<u32>,
}

impl LaneConfig {
    /// Unthrottled lane with default concurrency.
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            worker_count: crate::DEFAULT_WORKER_COUNT,
            rate_limit_interval: None,
            max_leases_per_minute: Some(crate::DEFAULT_LEASES_PER_MINUTE),
        }
    }

    /// The outbound SMS lane, one send per 20 seconds.
    pub fn bulk_sms() -> Self {
        Self::new(Lane::bulk_sms()).with_rate_limit(DEFAULT_BULK_SMS_INTERVAL)
    }

    /// The file processing lane.
    pub fn files() -> Self {
        Self::new(Lane::files())
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Throttles the lane to one invocation per `interval`.
    #[must_use]
    pub fn with_rate_limit(mut self, interval: Duration) -> Self {
        self.rate_limit_interval = Some(interval);
        self
    }

    /// Removes throttling.
    #[must_use]
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit_interval = None;
        self
    }

    /// Sets the per-minute lease cap.
    #[must_use]
    pub fn with_lease_cap(mut self, cap: Option<u32>) -> Self {
        self.max_leases_per_minute = cap;
        self
    }
}

/// Configuration for the dispatch engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Lanes to serve, each with its own workers.
    pub lanes: Vec<LaneConfig>,

    /// How often idle workers poll for due jobs.
    pub poll_interval: Duration,

    /// Pause after the store fails before polling again.
    pub store_error_backoff: Duration,

    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,

    /// Shutdown timeout - maximum time to wait for in-flight handlers.
    pub drain_timeout: Duration,

    /// Period of the prune/requeue pass. `None` disables it.
    pub maintenance_interval: Option<Duration>,

    /// Active jobs leased longer ago than this are considered abandoned.
    pub stale_lease_after: Duration,

    /// Retention for completed and failed jobs.
    pub prune_policy: PrunePolicy,

    /// Backoff applied to failed attempts.
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lanes: vec![LaneConfig::bulk_sms(), LaneConfig::files()],
            poll_interval: Duration::from_secs(1),
            store_error_backoff: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
            maintenance_interval: Some(Duration::from_secs(60)),
            stale_lease_after: Duration::from_secs(15 * 60),
            prune_policy: PrunePolicy::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.lanes.is_empty() {
            return Err(DispatchError::configuration("at least one lane must be configured"));
        }

        let mut seen = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            if seen.contains(&&lane.lane) {
                return Err(DispatchError::configuration(format!(
                    "lane {} configured more than once",
                    lane.lane
                )));
            }
            seen.push(&lane.lane);

            if lane.worker_count == 0 {
                return Err(DispatchError::configuration(format!(
                    "lane {} needs at least one worker",
                    lane.lane
                )));
            }
            if lane.rate_limit_interval == Some(Duration::ZERO) {
                return Err(DispatchError::configuration(format!(
                    "lane {} has a zero rate limit interval",
                    lane.lane
                )));
            }
            if lane.max_leases_per_minute == Some(0) {
                return Err(DispatchError::configuration(format!(
                    "lane {} has a zero lease cap",
                    lane.lane
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(DispatchError::configuration("poll_interval must be positive"));
        }
        if self.handler_timeout.is_zero() {
            return Err(DispatchError::configuration("handler_timeout must be positive"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DispatchError::configuration("max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(DispatchError::configuration("jitter_factor must be within 0.0..=1.0"));
        }
        if self.maintenance_interval == Some(Duration::ZERO) {
            return Err(DispatchError::configuration("maintenance_interval must be positive"));
        }
        if self.stale_lease_after <= self.handler_timeout {
            return Err(DispatchError::configuration(
                "stale_lease_after must exceed handler_timeout",
            ));
        }
        for lane in &self.lanes {
            let longest_lease = self.longest_lease(lane);
            if self.stale_lease_after <= longest_lease {
                return Err(DispatchError::configuration(format!(
                    "stale_lease_after must exceed the longest lease on lane {} ({}s of permit wait \
                     and handler time)",
                    lane.lane,
                    longest_lease.as_secs()
                )));
            }
        }

        Ok(())
    }

    /// Longest a healthy worker can hold a lease on `lane`.
    ///
    /// Workers lease before taking a rate permit, so on a throttled lane a
    /// lease may wait behind every other worker's permit before the handler
    /// even starts.
    fn longest_lease(&self, lane: &LaneConfig) -> Duration {
        let permit_wait = lane.rate_limit_interval.map_or(Duration::ZERO, |interval| {
            let ahead = u32::try_from(lane.worker_count.saturating_sub(1)).unwrap_or(u32::MAX);
            interval.saturating_mul(ahead)
        });
        permit_wait.saturating_add(self.handler_timeout)
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval,
            store_error_backoff: self.store_error_backoff,
            handler_timeout: self.handler_timeout,
        }
    }
}

/// Statistics for dispatch engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running workers across all lanes.
    pub active_workers: usize,
    /// Handler invocations since startup.
    pub jobs_processed: u64,
    /// Jobs marked completed.
    pub completed: u64,
    /// Failed attempts that were rescheduled.
    pub retried: u64,
    /// Jobs that failed for good.
    pub failed: u64,
    /// Leases handed back without invoking the handler.
    pub released: u64,
    /// Handlers currently running.
    pub in_flight: u64,
    /// Completed maintenance passes.
    pub maintenance_runs: u64,
    /// Jobs deleted by maintenance.
    pub pruned: u64,
    /// Stale leases returned to the queue by maintenance.
    pub requeued: u64,
}

/// Result of one maintenance pass over every lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Terminal jobs deleted.
    pub pruned: u64,
    /// Abandoned leases requeued.
    pub requeued: u64,
}

/// Main dispatch engine coordinating workers and maintenance.
pub struct DispatchEngine {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    limiter: Arc<RateLimiter>,
    lease_windows: HashMap<Lane, Arc<LeaseWindow>>,
    config: EngineConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    maintenance: Option<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
}

impl DispatchEngine {
    /// Creates a new engine over `store`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if `config` fails validation.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = config.lanes.iter().fold(RateLimiter::new(clock.clone()), |limiter, lane| {
            match lane.rate_limit_interval {
                Some(interval) => limiter.with_interval(lane.lane.clone(), interval),
                None => limiter,
            }
        });

        let lease_windows = config
            .lanes
            .iter()
            .map(|lane| {
                let window = LeaseWindow::new(lane.max_leases_per_minute, clock.clone());
                (lane.lane.clone(), Arc::new(window))
            })
            .collect();

        Ok(Self {
            store,
            registry: Arc::new(registry),
            limiter: Arc::new(limiter),
            lease_windows,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            maintenance: None,
            clock,
        })
    }

    /// Starts the workers for every lane and the maintenance task.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully, or drop the engine to cancel workers immediately.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the engine already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DispatchError::configuration("dispatch engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DispatchError::configuration("dispatch engine cannot restart"));
        }

        info!(
            lanes = self.config.lanes.len(),
            handlers = self.registry.len(),
            "starting dispatch engine"
        );

        for lane in &self.config.lanes {
            info!(
                lane = %lane.lane,
                worker_count = lane.worker_count,
                rate_limit_ms = lane.rate_limit_interval.map(|interval| interval.as_millis()),
                lease_cap = lane.max_leases_per_minute,
                "lane configured"
            );
        }

        let mut lanes = Vec::with_capacity(self.config.lanes.len());
        for lane in &self.config.lanes {
            lanes.push(LaneWorkers {
                ctx: self.worker_context(&lane.lane)?,
                worker_count: lane.worker_count,
            });
        }

        let mut worker_pool =
            WorkerPool::new(lanes, self.stats.clone(), self.cancellation_token.clone());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        if let Some(interval) = self.config.maintenance_interval {
            self.maintenance = Some(self.spawn_maintenance(interval));
        }

        info!("dispatch engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the engine.
    ///
    /// Signals all workers to stop leasing and waits for in-flight handlers
    /// to finish within the configured drain timeout.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` when handlers outlive the
    /// drain window, or `DispatchError::WorkerPanic` if a worker panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down dispatch engine");

        self.cancellation_token.cancel();

        if let Some(maintenance) = self.maintenance.take() {
            if let Err(join_error) = maintenance.await {
                warn!(error = %join_error, "maintenance task ended abnormally");
            }
        }

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.drain_timeout).await
        } else {
            info!("dispatch engine was not started, shutdown completed immediately");
            Ok(())
        }
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Leases and processes at most one job from `lane` on the caller's task.
    ///
    /// Goes through the same lease cap, rate limiter and retry policy as a
    /// pooled worker.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InvalidInput` for a lane the engine does not
    /// serve, or the store error that interrupted processing.
    pub async fn run_once(&self, lane: &Lane) -> Result<Option<JobOutcome>> {
        let ctx = self.worker_context(lane)?;
        let worker = DispatchWorker::new(0, ctx, self.cancellation_token.child_token());
        worker.process_next().await
    }

    /// Runs one prune and stale-lease pass over every lane.
    ///
    /// # Errors
    ///
    /// Returns the first store error. Lanes processed before it keep their
    /// changes.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let lanes: Vec<Lane> = self.config.lanes.iter().map(|lane| lane.lane.clone()).collect();
        let report = maintain(
            self.store.as_ref(),
            &lanes,
            self.config.prune_policy,
            self.config.stale_lease_after,
            self.clock.as_ref(),
        )
        .await?;

        record_maintenance(&self.stats, report).await;
        Ok(report)
    }

    fn worker_context(&self, lane: &Lane) -> Result<WorkerContext> {
        let lease_window = self
            .lease_windows
            .get(lane)
            .cloned()
            .ok_or_else(|| DispatchError::invalid_input(format!("lane {lane} is not served")))?;

        Ok(WorkerContext {
            lane: lane.clone(),
            store: self.store.clone(),
            limiter: self.limiter.clone(),
            lease_window,
            registry: self.registry.clone(),
            retry_policy: self.config.retry_policy.clone(),
            settings: self.config.worker_settings(),
            stats: self.stats.clone(),
            clock: self.clock.clone(),
        })
    }

    fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        let stats = self.stats.clone();
        let clock = self.clock.clone();
        let token = self.cancellation_token.clone();
        let lanes: Vec<Lane> = self.config.lanes.iter().map(|lane| lane.lane.clone()).collect();
        let policy = self.config.prune_policy;
        let stale_after = self.config.stale_lease_after;

        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis(), "maintenance task starting");

            loop {
                tokio::select! {
                    () = clock.sleep(interval) => {}
                    () = token.cancelled() => break,
                }

                match maintain(store.as_ref(), &lanes, policy, stale_after, clock.as_ref()).await {
                    Ok(report) => record_maintenance(&stats, report).await,
                    Err(error) => {
                        error!(error = %error, "maintenance pass failed");
                    },
                }
            }

            info!("maintenance task stopped");
        })
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
        }
    }
}

async fn maintain(
    store: &dyn JobStore,
    lanes: &[Lane],
    policy: PrunePolicy,
    stale_after: Duration,
    clock: &dyn Clock,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();
    let leased_before = cutoff_before(clock.now_utc(), stale_after);

    for lane in lanes {
        let requeued = store.requeue_stale(lane.clone(), leased_before).await?;
        let pruned = store.prune(lane.clone(), policy).await?.removed;

        if requeued > 0 {
            warn!(lane = %lane, requeued, "requeued jobs with abandoned leases");
        }
        debug!(lane = %lane, pruned, requeued, "maintenance pass for lane finished");

        report.pruned += pruned;
        report.requeued += requeued;
    }

    Ok(report)
}

async fn record_maintenance(stats: &RwLock<EngineStats>, report: MaintenanceReport) {
    let mut stats = stats.write().await;
    stats.maintenance_runs += 1;
    stats.pruned += report.pruned;
    stats.requeued += report.requeued;
}
