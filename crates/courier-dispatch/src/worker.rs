//! Dispatch worker: lease, throttle, invoke, record.
//!
//! Each worker owns one poll loop over one lane. A leased job gets exactly
//! one handler invocation, bounded by the handler timeout, and exactly one
//! outcome write back to the store.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{Clock, Job, Lane};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DispatchError, ErrorCategory, HandlerError, Result},
    handler::{HandlerRegistry, JobContext},
    lease::LeaseWindow,
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::JobStore,
};

/// Timing knobs shared by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Idle sleep when no job is due.
    pub poll_interval: Duration,
    /// Sleep after the store fails.
    pub store_error_backoff: Duration,
    /// Upper bound on one handler invocation.
    pub handler_timeout: Duration,
}

/// Everything a worker of one lane needs, shared between its siblings.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub lane: Lane,
    pub store: Arc<dyn JobStore>,
    pub limiter: Arc<RateLimiter>,
    pub lease_window: Arc<LeaseWindow>,
    pub registry: Arc<HandlerRegistry>,
    pub retry_policy: RetryPolicy,
    pub settings: WorkerSettings,
    pub stats: Arc<RwLock<EngineStats>>,
    pub clock: Arc<dyn Clock>,
}

/// What happened to the job a worker leased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded.
    Completed,
    /// Handler failed and the job is due again at `next_run_at`.
    Retried {
        /// When the job becomes eligible again
        next_run_at: DateTime<Utc>,
    },
    /// Handler failed for good.
    Failed {
        /// Why no retry was scheduled
        reason: String,
    },
    /// Shutdown arrived before the rate permit. The handler never ran.
    Released,
    /// The outcome write lost a race; another party already moved the job.
    Abandoned,
}

/// Worker processing one lane until cancelled.
pub(crate) struct DispatchWorker {
    id: usize,
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
}

impl DispatchWorker {
    pub(crate) fn new(id: usize, ctx: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { id, ctx, cancellation_token }
    }

    /// Main worker loop. Leases and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Never returns an error today. Store failures are logged and retried
    /// after the configured backoff.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, lane = %self.ctx.lane, "dispatch worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, lane = %self.ctx.lane, "dispatch worker received shutdown signal");
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => {},
                Ok(None) => {
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.settings.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        lane = %self.ctx.lane,
                        category = %ErrorCategory::from(&error),
                        error = %error,
                        "worker poll failed"
                    );
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.settings.store_error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, lane = %self.ctx.lane, "dispatch worker stopped");
        Ok(())
    }

    /// Leases and fully processes at most one job.
    ///
    /// Returns `None` when nothing is due or the lane's lease cap is used up.
    ///
    /// # Errors
    ///
    /// Returns error when the store cannot be reached while leasing or while
    /// recording the outcome. A job whose outcome could not be written stays
    /// `active` until stale-lease recovery requeues it.
    pub(crate) async fn process_next(&self) -> Result<Option<JobOutcome>> {
        let leased =
            self.ctx.lease_window.lease_next(self.ctx.store.as_ref(), &self.ctx.lane).await?;

        let Some(job) = leased else {
            return Ok(None);
        };

        debug!(
            worker_id = self.id,
            lane = %self.ctx.lane,
            job_id = %job.id,
            attempt = job.attempts,
            "leased job"
        );

        if self.ctx.limiter.is_throttled(&self.ctx.lane) {
            let permit = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => None,
                granted = self.ctx.limiter.acquire(&self.ctx.lane) => Some(granted),
            };

            if permit.is_none() {
                return self.release(&job).await.map(Some);
            }
        }

        let result = self.invoke(&job).await;
        self.record_outcome(&job, result).await.map(Some)
    }

    async fn invoke(&self, job: &Job) -> std::result::Result<(), HandlerError> {
        let ctx = JobContext::from_job(job);
        let timeout = self.ctx.settings.handler_timeout;

        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight += 1;
        }

        let result = match self.ctx.registry.get(job.kind()) {
            Some(handler) => match tokio::time::timeout(timeout, handler.handle(&ctx)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(HandlerError::timeout(timeout)),
            },
            None => Err(HandlerError::Unhandled { kind: job.kind().to_string() }),
        };

        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.jobs_processed += 1;
        }

        result
    }

    async fn record_outcome(
        &self,
        job: &Job,
        result: std::result::Result<(), HandlerError>,
    ) -> Result<JobOutcome> {
        let error = match result {
            Ok(()) => {
                if let Some(outcome) = self.write(job, self.ctx.store.mark_completed(job.lease())).await? {
                    return Ok(outcome);
                }
                self.ctx.stats.write().await.completed += 1;
                info!(
                    worker_id = self.id,
                    lane = %self.ctx.lane,
                    job_id = %job.id,
                    attempt = job.attempts,
                    "job completed"
                );
                return Ok(JobOutcome::Completed);
            },
            Err(error) => error,
        };

        let attempt = u32::try_from(job.attempts).unwrap_or(u32::MAX);
        let policy = self.policy_for(job);
        let decision =
            RetryContext::new(attempt, error.clone(), self.ctx.clock.now_utc(), policy).decide_retry();

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                let write = self.ctx.store.mark_failed_retryable(
                    job.lease(),
                    error.to_string(),
                    next_attempt_at,
                );
                if let Some(outcome) = self.write(job, write).await? {
                    return Ok(outcome);
                }
                self.ctx.stats.write().await.retried += 1;
                warn!(
                    worker_id = self.id,
                    lane = %self.ctx.lane,
                    job_id = %job.id,
                    attempt,
                    next_run_at = %next_attempt_at,
                    error = %error,
                    "job failed, retry scheduled"
                );
                Ok(JobOutcome::Retried { next_run_at: next_attempt_at })
            },
            RetryDecision::GiveUp { reason } => {
                let write = self.ctx.store.mark_failed_terminal(job.lease(), error.to_string());
                if let Some(outcome) = self.write(job, write).await? {
                    return Ok(outcome);
                }
                self.ctx.stats.write().await.failed += 1;
                error!(
                    worker_id = self.id,
                    lane = %self.ctx.lane,
                    job_id = %job.id,
                    attempt,
                    category = %ErrorCategory::from(&error),
                    reason = %reason,
                    error = %error,
                    "job permanently failed"
                );
                Ok(JobOutcome::Failed { reason })
            },
        }
    }

    async fn release(&self, job: &Job) -> Result<JobOutcome> {
        if let Some(outcome) = self.write(job, self.ctx.store.release_lease(job.lease())).await? {
            return Ok(outcome);
        }
        self.ctx.stats.write().await.released += 1;
        info!(
            worker_id = self.id,
            lane = %self.ctx.lane,
            job_id = %job.id,
            "shutdown before rate permit, lease released"
        );
        Ok(JobOutcome::Released)
    }

    /// Awaits an outcome write. Conflicts become [`JobOutcome::Abandoned`].
    async fn write(
        &self,
        job: &Job,
        write: crate::storage::StoreFuture<'_, ()>,
    ) -> Result<Option<JobOutcome>> {
        match write.await {
            Ok(()) => Ok(None),
            Err(error) if error.is_conflict() => {
                warn!(
                    worker_id = self.id,
                    lane = %self.ctx.lane,
                    job_id = %job.id,
                    error = %error,
                    "job changed state while leased, outcome dropped"
                );
                Ok(Some(JobOutcome::Abandoned))
            },
            Err(error) => Err(DispatchError::from(error)),
        }
    }

    /// Engine-wide delays with the job's own attempt ceiling.
    fn policy_for(&self, job: &Job) -> RetryPolicy {
        let max_attempts = u32::try_from(job.max_attempts)
            .unwrap_or(self.ctx.retry_policy.max_attempts);
        self.ctx.retry_policy.with_max_attempts(max_attempts)
    }
}
