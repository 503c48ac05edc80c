//! Job store abstraction used by workers, the queue facade and shutdown.
//!
//! Production runs against PostgreSQL through [`PostgresJobStore`]. The
//! [`memory::InMemoryJobStore`] keeps the same semantics in process memory
//! for tests, benchmarks and single-process deployments.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result, storage::Storage, Clock, EnqueueOptions, Job, JobId, JobPayload, JobSummary,
    Lane, Lease, PruneOutcome, PrunePolicy, QueueStats,
};

/// Boxed future returned by every store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable job persistence shared by all workers.
///
/// Every lifecycle update names the [`Lease`] it was made under. A job now
/// active under a different lease yields `CoreError::LeaseConflict`, a job in
/// any other state `CoreError::InvalidTransition`. Transport failures surface
/// as `CoreError::StoreUnavailable`.
pub trait JobStore: Send + Sync + 'static {
    /// Persists a new job and returns its id.
    ///
    /// The job starts `waiting`, or `delayed` until `now + delay` when a
    /// positive delay is given.
    fn enqueue(
        &self,
        lane: Lane,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> StoreFuture<'_, JobId>;

    /// Atomically leases the oldest due job in `lane`.
    ///
    /// Ordering is `(next_run_at, created_at, insertion order)`. The leased
    /// job is `active` with `attempts` already incremented.
    fn lease_next(&self, lane: Lane) -> StoreFuture<'_, Option<Job>>;

    /// Marks an active job as completed.
    fn mark_completed(&self, lease: Lease) -> StoreFuture<'_, ()>;

    /// Moves an active job to `delayed` until `next_run_at`.
    fn mark_failed_retryable(
        &self,
        lease: Lease,
        error: String,
        next_run_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Moves an active job to `failed`. Terminal.
    fn mark_failed_terminal(&self, lease: Lease, error: String) -> StoreFuture<'_, ()>;

    /// Returns a lease whose handler never ran.
    ///
    /// The job is due immediately and the attempt is refunded.
    fn release_lease(&self, lease: Lease) -> StoreFuture<'_, ()>;

    /// Deletes a `waiting` or `delayed` job. `false` when nothing was removed.
    fn remove(&self, job_id: JobId) -> StoreFuture<'_, bool>;

    /// Deletes terminal jobs in `lane` outside the retention policy.
    fn prune(&self, lane: Lane, policy: PrunePolicy) -> StoreFuture<'_, PruneOutcome>;

    /// Per-state counts for `lane`.
    fn stats(&self, lane: Lane) -> StoreFuture<'_, QueueStats>;

    /// Newest jobs in `lane`, newest first.
    fn list_recent(&self, lane: Lane, limit: usize) -> StoreFuture<'_, Vec<JobSummary>>;

    /// Looks up a single job.
    fn find_job(&self, job_id: JobId) -> StoreFuture<'_, Option<Job>>;

    /// Requeues active jobs in `lane` leased before `leased_before`.
    ///
    /// Attempts are kept since the handler may have run. Jobs with no attempts
    /// left are failed instead.
    fn requeue_stale(&self, lane: Lane, leased_before: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Verifies the store answers.
    fn health_check(&self) -> StoreFuture<'_, ()>;

    /// Releases the underlying connection. Later calls fail as unavailable.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production store backed by the PostgreSQL `jobs` repository.
pub struct PostgresJobStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresJobStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl JobStore for PostgresJobStore {
    fn enqueue(
        &self,
        lane: Lane,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> StoreFuture<'_, JobId> {
        Box::pin(async move {
            let job = Job::new(lane, payload, options, self.clock.now_utc())?;
            self.storage.jobs.insert(&job).await
        })
    }

    fn lease_next(&self, lane: Lane) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move { self.storage.jobs.lease_next(&lane, self.clock.now_utc()).await })
    }

    fn mark_completed(&self, lease: Lease) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.jobs.mark_completed(lease, self.clock.now_utc()).await })
    }

    fn mark_failed_retryable(
        &self,
        lease: Lease,
        error: String,
        next_run_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.storage.jobs.mark_failed_retryable(lease, &error, next_run_at).await
        })
    }

    fn mark_failed_terminal(&self, lease: Lease, error: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.storage.jobs.mark_failed_terminal(lease, &error, self.clock.now_utc()).await
        })
    }

    fn release_lease(&self, lease: Lease) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.jobs.release_lease(lease, self.clock.now_utc()).await })
    }

    fn remove(&self, job_id: JobId) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.jobs.remove_pending(job_id).await })
    }

    fn prune(&self, lane: Lane, policy: PrunePolicy) -> StoreFuture<'_, PruneOutcome> {
        Box::pin(async move {
            let removed = self.storage.jobs.prune(&lane, &policy, self.clock.now_utc()).await?;
            Ok(PruneOutcome { removed })
        })
    }

    fn stats(&self, lane: Lane) -> StoreFuture<'_, QueueStats> {
        Box::pin(async move { self.storage.jobs.stats(&lane).await })
    }

    fn list_recent(&self, lane: Lane, limit: usize) -> StoreFuture<'_, Vec<JobSummary>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            self.storage.jobs.list_recent(&lane, limit).await
        })
    }

    fn find_job(&self, job_id: JobId) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move { self.storage.jobs.find_by_id(job_id).await })
    }

    fn requeue_stale(&self, lane: Lane, leased_before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.storage.jobs.requeue_stale(&lane, leased_before, self.clock.now_utc()).await
        })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.health_check().await })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move { self.storage.close().await })
    }
}

pub mod memory {
    //! In-memory job store.
    //!
    //! Holds every job behind one async `RwLock`; leasing happens inside a
    //! single write-locked section, which gives the same "one lease per job"
    //! guarantee `SKIP LOCKED` gives in PostgreSQL. Supports injecting a
    //! transport failure and closing, so unavailability paths can be tested.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::cutoff_before,
        Clock, EnqueueOptions, Job, JobId, JobPayload, JobState, JobSummary, Lane, Lease,
        PruneOutcome, PrunePolicy, QueueStats,
    };
    use tokio::sync::RwLock;

    use super::{JobStore, StoreFuture};

    #[derive(Debug, Clone)]
    struct Entry {
        seq: u64,
        job: Job,
    }

    #[derive(Debug, Default)]
    struct State {
        jobs: HashMap<JobId, Entry>,
        next_seq: u64,
    }

    /// Job store kept entirely in process memory.
    #[derive(Debug)]
    pub struct InMemoryJobStore {
        state: RwLock<State>,
        closed: AtomicBool,
        injected_error: RwLock<Option<String>>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryJobStore {
        /// Creates an empty store.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                state: RwLock::new(State::default()),
                closed: AtomicBool::new(false),
                injected_error: RwLock::new(None),
                clock,
            }
        }

        /// Makes the next store call fail with `StoreUnavailable`.
        pub async fn inject_store_error(&self, message: impl Into<String>) {
            *self.injected_error.write().await = Some(message.into());
        }

        /// Whether [`JobStore::close`] has been called.
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }

        /// Reads a job regardless of whether the store is closed.
        pub async fn job(&self, job_id: JobId) -> Option<Job> {
            self.state.read().await.jobs.get(&job_id).map(|entry| entry.job.clone())
        }

        /// Every job in `lane`, in insertion order.
        pub async fn jobs_in(&self, lane: &Lane) -> Vec<Job> {
            let state = self.state.read().await;
            let mut entries: Vec<&Entry> =
                state.jobs.values().filter(|entry| &entry.job.lane == lane).collect();
            entries.sort_by_key(|entry| entry.seq);
            entries.into_iter().map(|entry| entry.job.clone()).collect()
        }

        /// Number of stored jobs across all lanes.
        pub async fn len(&self) -> usize {
            self.state.read().await.jobs.len()
        }

        /// Whether the store holds no jobs.
        pub async fn is_empty(&self) -> bool {
            self.len().await == 0
        }

        async fn ensure_available(&self) -> Result<()> {
            if self.is_closed() {
                return Err(CoreError::StoreUnavailable("job store is closed".to_string()));
            }

            if let Some(message) = self.injected_error.write().await.take() {
                return Err(CoreError::StoreUnavailable(message));
            }

            Ok(())
        }

        /// Applies `apply` to a job still held under `lease`, or reports why
        /// it cannot.
        async fn transition_active(
            &self,
            lease: Lease,
            to: JobState,
            apply: impl FnOnce(&mut Job, DateTime<Utc>) + Send,
        ) -> Result<()> {
            self.ensure_available().await?;
            let now = self.clock.now_utc();

            let job_id = lease.job_id;
            let mut state = self.state.write().await;
            let entry = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| CoreError::NotFound(format!("job {job_id} not found")))?;

            if entry.job.state == JobState::Active && !lease.holds(&entry.job) {
                return Err(CoreError::LeaseConflict { job_id });
            }
            if !entry.job.state.can_transition_to(to) {
                return Err(CoreError::InvalidTransition { job_id, from: entry.job.state, to });
            }

            apply(&mut entry.job, now);
            entry.job.state = to;
            entry.job.leased_at = None;
            Ok(())
        }
    }

    impl JobStore for InMemoryJobStore {
        fn enqueue(
            &self,
            lane: Lane,
            payload: JobPayload,
            options: EnqueueOptions,
        ) -> StoreFuture<'_, JobId> {
            Box::pin(async move {
                self.ensure_available().await?;
                let job = Job::new(lane, payload, options, self.clock.now_utc())?;
                let job_id = job.id;

                let mut state = self.state.write().await;
                let seq = state.next_seq;
                state.next_seq += 1;
                state.jobs.insert(job_id, Entry { seq, job });

                Ok(job_id)
            })
        }

        fn lease_next(&self, lane: Lane) -> StoreFuture<'_, Option<Job>> {
            Box::pin(async move {
                self.ensure_available().await?;
                let now = self.clock.now_utc();

                let mut state = self.state.write().await;
                let next = state
                    .jobs
                    .values_mut()
                    .filter(|entry| entry.job.lane == lane && entry.job.is_due(now))
                    .min_by_key(|entry| (entry.job.next_run_at, entry.job.created_at, entry.seq));

                Ok(next.map(|entry| {
                    entry.job.state = JobState::Active;
                    entry.job.attempts += 1;
                    entry.job.leased_at = Some(now);
                    entry.job.clone()
                }))
            })
        }

        fn mark_completed(&self, lease: Lease) -> StoreFuture<'_, ()> {
            Box::pin(self.transition_active(lease, JobState::Completed, |job, now| {
                job.completed_at = Some(now);
            }))
        }

        fn mark_failed_retryable(
            &self,
            lease: Lease,
            error: String,
            next_run_at: DateTime<Utc>,
        ) -> StoreFuture<'_, ()> {
            Box::pin(self.transition_active(lease, JobState::Delayed, move |job, _| {
                job.next_run_at = next_run_at;
                job.last_error = Some(error);
            }))
        }

        fn mark_failed_terminal(&self, lease: Lease, error: String) -> StoreFuture<'_, ()> {
            Box::pin(self.transition_active(lease, JobState::Failed, move |job, now| {
                job.failed_at = Some(now);
                job.last_error = Some(error);
            }))
        }

        fn release_lease(&self, lease: Lease) -> StoreFuture<'_, ()> {
            Box::pin(self.transition_active(lease, JobState::Delayed, |job, now| {
                job.attempts = (job.attempts - 1).max(0);
                job.next_run_at = job.next_run_at.min(now);
            }))
        }

        fn remove(&self, job_id: JobId) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.ensure_available().await?;

                let mut state = self.state.write().await;
                let removable =
                    state.jobs.get(&job_id).is_some_and(|entry| entry.job.state.is_cancellable());
                if removable {
                    state.jobs.remove(&job_id);
                }

                Ok(removable)
            })
        }

        fn prune(&self, lane: Lane, policy: PrunePolicy) -> StoreFuture<'_, PruneOutcome> {
            Box::pin(async move {
                self.ensure_available().await?;
                let now = self.clock.now_utc();
                let completed_cutoff = cutoff_before(now, policy.completed_max_age);
                let failed_cutoff = policy.failed_max_age.map(|age| cutoff_before(now, age));

                let mut state = self.state.write().await;

                let mut completed: Vec<(DateTime<Utc>, u64, JobId)> = state
                    .jobs
                    .values()
                    .filter(|entry| {
                        entry.job.lane == lane && entry.job.state == JobState::Completed
                    })
                    .map(|entry| {
                        let completed_at = entry.job.completed_at.unwrap_or(entry.job.created_at);
                        (completed_at, entry.seq, entry.job.id)
                    })
                    .collect();
                completed.sort_by(|a, b| b.cmp(a));

                let mut doomed: Vec<JobId> = completed
                    .iter()
                    .enumerate()
                    .filter(|(rank, (completed_at, _, _))| {
                        *completed_at < completed_cutoff || *rank >= policy.completed_retain
                    })
                    .map(|(_, (_, _, id))| *id)
                    .collect();

                if let Some(cutoff) = failed_cutoff {
                    doomed.extend(
                        state
                            .jobs
                            .values()
                            .filter(|entry| {
                                entry.job.lane == lane
                                    && entry.job.state == JobState::Failed
                                    && entry.job.failed_at.is_some_and(|at| at < cutoff)
                            })
                            .map(|entry| entry.job.id),
                    );
                }

                for job_id in &doomed {
                    state.jobs.remove(job_id);
                }

                Ok(PruneOutcome { removed: u64::try_from(doomed.len()).unwrap_or(u64::MAX) })
            })
        }

        fn stats(&self, lane: Lane) -> StoreFuture<'_, QueueStats> {
            Box::pin(async move {
                self.ensure_available().await?;

                let state = self.state.read().await;
                let mut stats = QueueStats::default();
                for entry in state.jobs.values().filter(|entry| entry.job.lane == lane) {
                    stats.record(entry.job.state, 1);
                }

                Ok(stats)
            })
        }

        fn list_recent(&self, lane: Lane, limit: usize) -> StoreFuture<'_, Vec<JobSummary>> {
            Box::pin(async move {
                self.ensure_available().await?;

                let state = self.state.read().await;
                let mut entries: Vec<&Entry> =
                    state.jobs.values().filter(|entry| entry.job.lane == lane).collect();
                entries.sort_by(|a, b| {
                    (b.job.created_at, b.seq).cmp(&(a.job.created_at, a.seq))
                });

                Ok(entries
                    .into_iter()
                    .take(limit)
                    .map(|entry| JobSummary::from(&entry.job))
                    .collect())
            })
        }

        fn find_job(&self, job_id: JobId) -> StoreFuture<'_, Option<Job>> {
            Box::pin(async move {
                self.ensure_available().await?;
                Ok(self.job(job_id).await)
            })
        }

        fn requeue_stale(
            &self,
            lane: Lane,
            leased_before: DateTime<Utc>,
        ) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                self.ensure_available().await?;
                let now = self.clock.now_utc();

                let mut state = self.state.write().await;
                let mut requeued = 0;
                for entry in state.jobs.values_mut() {
                    let job = &mut entry.job;
                    let stale = job.leased_at.is_some_and(|at| at < leased_before);
                    if job.lane == lane && job.state == JobState::Active && stale {
                        if job.attempts >= job.max_attempts {
                            job.state = JobState::Failed;
                            job.failed_at = Some(now);
                        } else {
                            job.state = JobState::Delayed;
                            job.next_run_at = now;
                        }
                        job.leased_at = None;
                        job.last_error.get_or_insert_with(|| "lease expired".to_string());
                        requeued += 1;
                    }
                }

                Ok(requeued)
            })
        }

        fn health_check(&self) -> StoreFuture<'_, ()> {
            Box::pin(self.ensure_available())
        }

        fn close(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                self.closed.store(true, Ordering::Release);
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{CoreError, FileOperation, JobState, TestClock};

    use super::{memory::InMemoryJobStore, *};

    fn store() -> (InMemoryJobStore, TestClock) {
        let clock = TestClock::new();
        (InMemoryJobStore::new(Arc::new(clock.clone())), clock)
    }

    fn message(content: &str) -> JobPayload {
        JobPayload::send_message("+15550100", content)
    }

    #[tokio::test]
    async fn lease_order_is_fifo_within_a_lane() {
        let (store, clock) = store();
        let mut ids = Vec::new();
        for content in ["A", "B", "C"] {
            let job_id = store
                .enqueue(Lane::bulk_sms(), message(content), EnqueueOptions::default())
                .await
                .unwrap();
            ids.push(job_id);
            clock.advance(Duration::from_millis(1));
        }

        for expected in ids {
            let job = store.lease_next(Lane::bulk_sms()).await.unwrap().unwrap();
            assert_eq!(job.id, expected);
            assert_eq!(job.state, JobState::Active);
            assert_eq!(job.attempts, 1);
        }
        assert!(store.lease_next(Lane::bulk_sms()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn jobs_enqueued_in_the_same_instant_keep_insertion_order() {
        let (store, _clock) = store();
        let first =
            store.enqueue(Lane::files(), message("1"), EnqueueOptions::default()).await.unwrap();
        let second =
            store.enqueue(Lane::files(), message("2"), EnqueueOptions::default()).await.unwrap();

        assert_eq!(store.lease_next(Lane::files()).await.unwrap().unwrap().id, first);
        assert_eq!(store.lease_next(Lane::files()).await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_next_run_at() {
        let (store, clock) = store();
        let options = EnqueueOptions::default().with_delay(Duration::from_secs(30));
        let job_id = store.enqueue(Lane::files(), message("later"), options).await.unwrap();

        assert_eq!(store.job(job_id).await.unwrap().state, JobState::Delayed);
        assert!(store.lease_next(Lane::files()).await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.lease_next(Lane::files()).await.unwrap().unwrap().id, job_id);
    }

    #[tokio::test]
    async fn lanes_do_not_block_each_other() {
        let (store, _clock) = store();
        store.enqueue(Lane::bulk_sms(), message("sms"), EnqueueOptions::default()).await.unwrap();
        let file = store
            .enqueue(
                Lane::files(),
                JobPayload::process_file("exports/june.csv", FileOperation::Export),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(store.lease_next(Lane::files()).await.unwrap().unwrap().id, file);
    }

    #[tokio::test]
    async fn lifecycle_updates_require_an_active_lease() {
        let (store, _clock) = store();
        let job_id =
            store.enqueue(Lane::files(), message("x"), EnqueueOptions::default()).await.unwrap();
        let pending = store.job(job_id).await.unwrap();

        let err = store.mark_completed(pending.lease()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition { from: JobState::Waiting, to: JobState::Completed, .. }
        ));

        let leased = store.lease_next(Lane::files()).await.unwrap().unwrap();
        store.mark_completed(leased.lease()).await.unwrap();

        let err = store.mark_failed_terminal(leased.lease(), "late".to_string()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.job(job_id).await.unwrap().state, JobState::Completed);

        let unknown = Lease { job_id: JobId::new(), leased_at: None, attempt: 1 };
        let missing = store.mark_completed(unknown).await.unwrap_err();
        assert!(matches!(missing, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn superseded_lease_cannot_write_an_outcome() {
        let (store, clock) = store();
        let job_id =
            store.enqueue(Lane::files(), message("x"), EnqueueOptions::default()).await.unwrap();
        let first = store.lease_next(Lane::files()).await.unwrap().unwrap();

        // The first worker stalls; recovery hands the job to a second one
        clock.advance(Duration::from_secs(60));
        assert_eq!(store.requeue_stale(Lane::files(), clock.now_utc()).await.unwrap(), 1);
        let second = store.lease_next(Lane::files()).await.unwrap().unwrap();
        assert_eq!(second.id, job_id);
        assert_eq!(second.attempts, 2);

        let err = store.mark_completed(first.lease()).await.unwrap_err();
        assert!(matches!(err, CoreError::LeaseConflict { job_id: conflicted } if conflicted == job_id));
        assert!(err.is_conflict());
        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.leased_at, second.leased_at);

        store.mark_completed(second.lease()).await.unwrap();
        assert_eq!(store.job(job_id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn retryable_failure_schedules_next_run() {
        let (store, clock) = store();
        let job_id =
            store.enqueue(Lane::files(), message("x"), EnqueueOptions::default()).await.unwrap();
        let leased = store.lease_next(Lane::files()).await.unwrap().unwrap();

        let next_run_at = clock.now_utc() + chrono::Duration::seconds(2);
        store.mark_failed_retryable(leased.lease(), "timeout".to_string(), next_run_at).await.unwrap();

        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.next_run_at, next_run_at);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert!(job.leased_at.is_none());
    }

    #[tokio::test]
    async fn release_refunds_the_attempt() {
        let (store, _clock) = store();
        let job_id =
            store.enqueue(Lane::bulk_sms(), message("x"), EnqueueOptions::default()).await.unwrap();
        let leased = store.lease_next(Lane::bulk_sms()).await.unwrap().unwrap();

        store.release_lease(leased.lease()).await.unwrap();

        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts, 0);
        assert_eq!(store.lease_next(Lane::bulk_sms()).await.unwrap().unwrap().id, job_id);
    }

    #[tokio::test]
    async fn remove_only_touches_pending_jobs() {
        let (store, _clock) = store();
        let leased =
            store.enqueue(Lane::files(), message("a"), EnqueueOptions::default()).await.unwrap();
        let pending =
            store.enqueue(Lane::files(), message("b"), EnqueueOptions::default()).await.unwrap();
        store.lease_next(Lane::files()).await.unwrap();

        assert!(!store.remove(leased).await.unwrap());
        assert_eq!(store.job(leased).await.unwrap().state, JobState::Active);

        assert!(store.remove(pending).await.unwrap());
        assert!(store.job(pending).await.is_none());
        assert!(!store.remove(JobId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn prune_applies_age_and_count_thresholds() {
        let (store, clock) = store();
        let policy = PrunePolicy {
            completed_max_age: Duration::from_secs(3600),
            completed_retain: 2,
            failed_max_age: None,
        };

        let mut completed = Vec::new();
        for i in 0..4 {
            let id = store
                .enqueue(Lane::files(), message(&i.to_string()), EnqueueOptions::default())
                .await
                .unwrap();
            let leased = store.lease_next(Lane::files()).await.unwrap().unwrap();
            store.mark_completed(leased.lease()).await.unwrap();
            completed.push(id);
            clock.advance(Duration::from_secs(1));
        }
        let failed =
            store.enqueue(Lane::files(), message("f"), EnqueueOptions::default()).await.unwrap();
        let leased = store.lease_next(Lane::files()).await.unwrap().unwrap();
        store.mark_failed_terminal(leased.lease(), "boom".to_string()).await.unwrap();
        let waiting =
            store.enqueue(Lane::files(), message("w"), EnqueueOptions::default()).await.unwrap();

        let outcome = store.prune(Lane::files(), policy).await.unwrap();

        assert_eq!(outcome.removed, 2);
        assert!(store.job(completed[0]).await.is_none());
        assert!(store.job(completed[1]).await.is_none());
        assert!(store.job(completed[3]).await.is_some());
        assert!(store.job(failed).await.is_some());
        assert!(store.job(waiting).await.is_some());

        clock.advance(Duration::from_secs(3601));
        let outcome = store.prune(Lane::files(), policy).await.unwrap();
        assert_eq!(outcome.removed, 2);
        assert!(store.job(failed).await.is_some());
    }

    #[tokio::test]
    async fn stats_and_listing_reflect_states() {
        let (store, clock) = store();
        let first =
            store.enqueue(Lane::files(), message("1"), EnqueueOptions::default()).await.unwrap();
        clock.advance(Duration::from_millis(5));
        let second =
            store.enqueue(Lane::files(), message("2"), EnqueueOptions::default()).await.unwrap();
        store.lease_next(Lane::files()).await.unwrap();

        let stats = store.stats(Lane::files()).await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.total(), 2);

        let recent = store.list_recent(Lane::files(), 10).await.unwrap();
        assert_eq!(recent.iter().map(|s| s.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(store.list_recent(Lane::files(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_leases_are_requeued_with_attempts_kept() {
        let (store, clock) = store();
        let job_id =
            store.enqueue(Lane::files(), message("x"), EnqueueOptions::default()).await.unwrap();
        store.lease_next(Lane::files()).await.unwrap();
        clock.advance(Duration::from_secs(900));

        let requeued = store.requeue_stale(Lane::files(), clock.now_utc()).await.unwrap();

        assert_eq!(requeued, 1);
        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn stale_final_attempt_is_failed() {
        let (store, clock) = store();
        let job_id = store
            .enqueue(Lane::files(), message("x"), EnqueueOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        store.lease_next(Lane::files()).await.unwrap();
        clock.advance(Duration::from_secs(900));

        store.requeue_stale(Lane::files(), clock.now_utc()).await.unwrap();

        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.failed_at.is_some());
        assert!(store.lease_next(Lane::files()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_errors_fail_one_call() {
        let (store, _clock) = store();
        store.inject_store_error("connection reset").await;

        let err = store.lease_next(Lane::files()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.lease_next(Lane::files()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_store_is_unavailable() {
        let (store, _clock) = store();
        store.close().await;

        assert!(store.is_closed());
        let err = store
            .enqueue(Lane::files(), message("x"), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn zero_max_attempts_is_rejected() {
        let (store, _clock) = store();

        let err = store
            .enqueue(Lane::files(), message("x"), EnqueueOptions::default().with_max_attempts(0))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn postgres_store_reports_closed_pool_as_unavailable() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Arc::new(Storage::new(pool));
        let store = PostgresJobStore::new(storage.clone(), Arc::new(TestClock::new()));

        store.close().await;

        assert!(storage.is_closed());
        let err = store.lease_next(Lane::bulk_sms()).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
