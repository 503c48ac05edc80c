//! Producer and dashboard facing queue API.
//!
//! The facade is the only way producers reach the store. It validates
//! payloads before they are persisted and moves through three phases during
//! shutdown: open, no longer accepting new jobs, closed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use courier_core::{
    EnqueueOptions, Job, JobId, JobPayload, JobState, JobSummary, Lane, PruneOutcome, PrunePolicy,
    QueueStats, DEFAULT_MAX_ATTEMPTS,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    error::{DispatchError, Result},
    storage::JobStore,
};

/// Upper bound on `list_recent`.
pub const MAX_LIST_LIMIT: usize = 100;

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was removed before any worker leased it.
    Cancelled,
    /// The job exists but is leased or finished.
    NotCancellable(JobState),
    /// No job with that id.
    NotFound,
}

/// Enqueue, inspect and prune jobs.
pub struct QueueFacade {
    store: RwLock<Option<Arc<dyn JobStore>>>,
    accepting: AtomicBool,
    prune_policy: PrunePolicy,
    default_max_attempts: u32,
}

impl QueueFacade {
    /// Opens a facade over `store`.
    ///
    /// `prune_completed` uses the completed thresholds of `prune_policy` and
    /// never deletes failed jobs.
    pub fn new(store: Arc<dyn JobStore>, prune_policy: PrunePolicy) -> Self {
        Self {
            store: RwLock::new(Some(store)),
            accepting: AtomicBool::new(true),
            prune_policy: prune_policy.completed_only(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempt ceiling for jobs enqueued without one.
    #[must_use]
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Attempt ceiling applied when the producer gives none.
    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts
    }

    /// Submits a job.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the facade stopped accepting,
    /// `InvalidInput` for malformed payloads, a zero attempt ceiling or a
    /// delay past `MAX_ENQUEUE_DELAY`, and
    /// `StoreUnavailable` when the store cannot be reached.
    pub async fn enqueue(
        &self,
        lane: Lane,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId> {
        if !self.is_accepting() {
            return Err(DispatchError::QueueClosed);
        }
        payload.validate()?;
        let options = match options.max_attempts {
            Some(_) => options,
            None => options.with_max_attempts(self.default_max_attempts),
        };

        let store = self.store().await?;
        let kind = payload.kind();
        let job_id = store.enqueue(lane.clone(), payload, options).await?;

        debug!(
            job_id = %job_id,
            lane = %lane,
            kind = %kind,
            delay_ms = options.delay.as_millis(),
            max_attempts = options.max_attempts,
            "job enqueued"
        );

        Ok(job_id)
    }

    /// Per-state counts for `lane`.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` after `close`, otherwise store errors.
    pub async fn stats(&self, lane: &Lane) -> Result<QueueStats> {
        Ok(self.store().await?.stats(lane.clone()).await?)
    }

    /// Deletes old completed jobs in `lane`. Failed jobs are kept.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` after `close`, otherwise store errors.
    pub async fn prune_completed(&self, lane: &Lane) -> Result<PruneOutcome> {
        let outcome = self.store().await?.prune(lane.clone(), self.prune_policy).await?;
        info!(lane = %lane, removed = outcome.removed, "pruned completed jobs");
        Ok(outcome)
    }

    /// Newest jobs in `lane`, at most [`MAX_LIST_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` after `close`, otherwise store errors.
    pub async fn list_recent(&self, lane: &Lane, limit: usize) -> Result<Vec<JobSummary>> {
        let limit = limit.min(MAX_LIST_LIMIT);
        Ok(self.store().await?.list_recent(lane.clone(), limit).await?)
    }

    /// Looks a job up by id.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` after `close`, otherwise store errors.
    pub async fn find_job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.store().await?.find_job(job_id).await?)
    }

    /// Removes a job that no worker has leased yet.
    ///
    /// Active and finished jobs are left alone.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` after `close`, otherwise store errors.
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        let store = self.store().await?;

        if store.remove(job_id).await? {
            info!(job_id = %job_id, "job cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        Ok(match store.find_job(job_id).await? {
            Some(job) => CancelOutcome::NotCancellable(job.state),
            None => CancelOutcome::NotFound,
        })
    }

    /// Checks the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` after `close`, otherwise the store's error.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.store().await?.health_check().await?)
    }

    /// Rejects further `enqueue` calls. Reads keep working.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("queue stopped accepting new jobs");
        }
    }

    /// Whether `enqueue` is accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Drops the facade's handle on the store. Every call fails afterwards.
    pub async fn close(&self) {
        self.stop_accepting();
        if self.store.write().await.take().is_some() {
            info!("queue facade closed");
        }
    }

    /// Whether `close` has run.
    pub async fn is_closed(&self) -> bool {
        self.store.read().await.is_none()
    }

    async fn store(&self) -> Result<Arc<dyn JobStore>> {
        self.store.read().await.clone().ok_or(DispatchError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{FileOperation, TestClock};

    use super::*;
    use crate::storage::memory::InMemoryJobStore;

    fn facade() -> (QueueFacade, Arc<InMemoryJobStore>, TestClock) {
        let clock = TestClock::new();
        let store = Arc::new(InMemoryJobStore::new(Arc::new(clock.clone())));
        (QueueFacade::new(store.clone(), PrunePolicy::default()), store, clock)
    }

    fn message() -> JobPayload {
        JobPayload::send_message("+15550100", "hello")
    }

    #[tokio::test]
    async fn enqueue_and_inspect() {
        let (facade, _store, _clock) = facade();

        let job_id =
            facade.enqueue(Lane::bulk_sms(), message(), EnqueueOptions::default()).await.unwrap();
        facade
            .enqueue(
                Lane::bulk_sms(),
                message(),
                EnqueueOptions::default().with_delay(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        let stats = facade.stats(&Lane::bulk_sms()).await.unwrap();
        assert_eq!(stats.count(JobState::Waiting), 1);
        assert_eq!(stats.count(JobState::Delayed), 1);

        let job = facade.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(facade.list_recent(&Lane::bulk_sms(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_storage() {
        let (facade, store, _clock) = facade();

        let err = facade
            .enqueue(Lane::bulk_sms(), JobPayload::send_message("", "hi"), EnqueueOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidInput { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delay_beyond_ceiling_is_rejected() {
        let (facade, store, _clock) = facade();

        let err = facade
            .enqueue(
                Lane::bulk_sms(),
                message(),
                EnqueueOptions::default().with_delay(Duration::from_millis(9_000_000_000_000_000_000)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidInput { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn configured_attempt_ceiling_fills_omitted_option() {
        let (facade, _store, _clock) = facade();
        let facade = facade.with_default_max_attempts(7);

        let defaulted =
            facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await.unwrap();
        let explicit = facade
            .enqueue(Lane::files(), message(), EnqueueOptions::default().with_max_attempts(2))
            .await
            .unwrap();

        assert_eq!(facade.find_job(defaulted).await.unwrap().unwrap().max_attempts, 7);
        assert_eq!(facade.find_job(explicit).await.unwrap().unwrap().max_attempts, 2);
    }

    #[tokio::test]
    async fn list_recent_is_bounded() {
        let (facade, _store, _clock) = facade();
        for _ in 0..(MAX_LIST_LIMIT + 5) {
            facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await.unwrap();
        }

        let listed = facade.list_recent(&Lane::files(), 1_000).await.unwrap();

        assert_eq!(listed.len(), MAX_LIST_LIMIT);
    }

    #[tokio::test]
    async fn cancel_only_removes_unleased_jobs() {
        let (facade, store, _clock) = facade();
        let leased =
            facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await.unwrap();
        let pending =
            facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await.unwrap();
        store.lease_next(Lane::files()).await.unwrap();

        assert_eq!(facade.cancel(pending).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            facade.cancel(leased).await.unwrap(),
            CancelOutcome::NotCancellable(JobState::Active)
        );
        assert_eq!(facade.cancel(JobId::new()).await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn prune_completed_leaves_failed_jobs() {
        let (facade, store, clock) = facade();
        let payload = JobPayload::process_file("a.csv", FileOperation::Import);
        let done = facade.enqueue(Lane::files(), payload.clone(), EnqueueOptions::default()).await.unwrap();
        let broken = facade.enqueue(Lane::files(), payload, EnqueueOptions::default()).await.unwrap();

        let leased = store.lease_next(Lane::files()).await.unwrap().unwrap();
        assert_eq!(leased.id, done);
        store.mark_completed(leased.lease()).await.unwrap();
        let leased = store.lease_next(Lane::files()).await.unwrap().unwrap();
        assert_eq!(leased.id, broken);
        store.mark_failed_terminal(leased.lease(), "bad file".to_string()).await.unwrap();

        clock.advance(Duration::from_secs(48 * 60 * 60));
        let outcome = facade.prune_completed(&Lane::files()).await.unwrap();

        assert_eq!(outcome.removed, 1);
        assert!(store.job(done).await.is_none());
        assert_eq!(store.job(broken).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn closing_phases() {
        let (facade, _store, _clock) = facade();
        facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await.unwrap();

        facade.stop_accepting();
        assert!(matches!(
            facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await,
            Err(DispatchError::QueueClosed)
        ));
        assert_eq!(facade.stats(&Lane::files()).await.unwrap().total(), 1);

        facade.close().await;
        assert!(facade.is_closed().await);
        assert!(matches!(facade.stats(&Lane::files()).await, Err(DispatchError::QueueClosed)));
        assert!(matches!(facade.health_check().await, Err(DispatchError::QueueClosed)));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_retryable() {
        let (facade, store, _clock) = facade();
        store.inject_store_error("connection reset").await;

        let err =
            facade.enqueue(Lane::files(), message(), EnqueueOptions::default()).await.unwrap_err();

        assert!(err.is_retryable());
    }
}
