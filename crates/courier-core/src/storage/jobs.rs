//! Repository for job records.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! each other and never receive the same job. Every lifecycle update is
//! conditional on the job still being `active` under the caller's lease,
//! which turns lost races into explicit errors instead of silent overwrites.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{
        cutoff_before, Job, JobId, JobState, JobSummary, Lane, Lease, PrunePolicy, QueueStats,
    },
};

/// Repository for job database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Persists a freshly built job.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or a constraint is violated.
    pub async fn insert(&self, job: &Job) -> Result<JobId> {
        self.insert_impl(&*self.pool, job).await
    }

    /// Persists a job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<JobId> {
        self.insert_impl(&mut **tx, job).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, job: &Job) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO jobs (
                id, lane, payload, state, attempts, max_attempts,
                next_run_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(job.id)
        .bind(&job.lane)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Leases the oldest due job in `lane`.
    ///
    /// Selection and update happen in one statement: the candidate row is
    /// locked with `SKIP LOCKED`, moved to `active`, stamped with `now` and its
    /// attempt counter incremented. Returns `None` when nothing is due.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn lease_next(&self, lane: &Lane, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r"
            WITH next_job AS (
                SELECT id FROM jobs
                WHERE lane = $1
                  AND state IN ('waiting', 'delayed')
                  AND next_run_at <= $2
                ORDER BY next_run_at ASC, created_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'active',
                attempts = jobs.attempts + 1,
                leased_at = $2
            FROM next_job
            WHERE jobs.id = next_job.id
              AND jobs.state IN ('waiting', 'delayed')
            RETURNING jobs.id, jobs.lane, jobs.payload, jobs.state, jobs.attempts,
                      jobs.max_attempts, jobs.next_run_at, jobs.created_at, jobs.leased_at,
                      jobs.completed_at, jobs.failed_at, jobs.last_error
            ",
        )
        .bind(lane)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Marks an active job as completed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseConflict` if the job moved to a newer lease,
    /// `CoreError::InvalidTransition` if it is no longer active, or
    /// `CoreError::NotFound` if it does not exist.
    pub async fn mark_completed(&self, lease: Lease, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'completed', completed_at = $4, leased_at = NULL
            WHERE id = $1 AND state = 'active' AND leased_at = $2 AND attempts = $3
            ",
        )
        .bind(lease.job_id)
        .bind(lease.leased_at)
        .bind(lease.attempt)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        self.ensure_transitioned(result.rows_affected(), lease, JobState::Completed).await
    }

    /// Returns an active job to `delayed` after a retryable failure.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseConflict` or `CoreError::InvalidTransition` if
    /// the lease is no longer current.
    pub async fn mark_failed_retryable(
        &self,
        lease: Lease,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'delayed', next_run_at = $4, last_error = $5, leased_at = NULL
            WHERE id = $1 AND state = 'active' AND leased_at = $2 AND attempts = $3
            ",
        )
        .bind(lease.job_id)
        .bind(lease.leased_at)
        .bind(lease.attempt)
        .bind(next_run_at)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        self.ensure_transitioned(result.rows_affected(), lease, JobState::Delayed).await
    }

    /// Marks an active job as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseConflict` or `CoreError::InvalidTransition` if
    /// the lease is no longer current.
    pub async fn mark_failed_terminal(
        &self,
        lease: Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'failed', failed_at = $4, last_error = $5, leased_at = NULL
            WHERE id = $1 AND state = 'active' AND leased_at = $2 AND attempts = $3
            ",
        )
        .bind(lease.job_id)
        .bind(lease.leased_at)
        .bind(lease.attempt)
        .bind(now)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        self.ensure_transitioned(result.rows_affected(), lease, JobState::Failed).await
    }

    /// Gives back a lease whose handler never ran.
    ///
    /// The job becomes due immediately and the attempt taken by the lease is
    /// refunded.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseConflict` or `CoreError::InvalidTransition` if
    /// the lease is no longer current.
    pub async fn release_lease(&self, lease: Lease, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = 'delayed',
                attempts = GREATEST(attempts - 1, 0),
                next_run_at = LEAST(next_run_at, $4),
                leased_at = NULL
            WHERE id = $1 AND state = 'active' AND leased_at = $2 AND attempts = $3
            ",
        )
        .bind(lease.job_id)
        .bind(lease.leased_at)
        .bind(lease.attempt)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        self.ensure_transitioned(result.rows_affected(), lease, JobState::Delayed).await
    }

    /// Deletes a job that has not been leased yet.
    ///
    /// Returns `false` when the job is missing or already active/terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn remove_pending(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM jobs
            WHERE id = $1 AND state IN ('waiting', 'delayed')
            ",
        )
        .bind(job_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes terminal jobs in `lane` that fall outside `policy`.
    ///
    /// Runs in one transaction so a concurrent prune cannot double count.
    ///
    /// # Errors
    ///
    /// Returns error if any delete fails.
    pub async fn prune(
        &self,
        lane: &Lane,
        policy: &PrunePolicy,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let aged = sqlx::query(
            r"
            DELETE FROM jobs
            WHERE lane = $1 AND state = 'completed' AND completed_at < $2
            ",
        )
        .bind(lane)
        .bind(cutoff_before(now, policy.completed_max_age))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let overflow = sqlx::query(
            r"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE lane = $1 AND state = 'completed'
                ORDER BY completed_at DESC, seq DESC
                OFFSET $2
            )
            ",
        )
        .bind(lane)
        .bind(i64::try_from(policy.completed_retain).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let failed = match policy.failed_max_age {
            Some(max_age) => sqlx::query(
                r"
                DELETE FROM jobs
                WHERE lane = $1 AND state = 'failed' AND failed_at < $2
                ",
            )
            .bind(lane)
            .bind(cutoff_before(now, max_age))
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            None => 0,
        };

        tx.commit().await?;

        Ok(aged + overflow + failed)
    }

    /// Counts jobs per state in `lane`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a stored state is unknown.
    pub async fn stats(&self, lane: &Lane) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r"
            SELECT state, COUNT(*) FROM jobs
            WHERE lane = $1
            GROUP BY state
            ",
        )
        .bind(lane)
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.record(state.parse()?, u64::try_from(count).unwrap_or(0));
        }

        Ok(stats)
    }

    /// Most recently enqueued jobs in `lane`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_recent(&self, lane: &Lane, limit: i64) -> Result<Vec<JobSummary>> {
        let summaries = sqlx::query_as::<_, JobSummary>(
            r"
            SELECT id, lane, state, attempts, created_at, last_error
            FROM jobs
            WHERE lane = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            ",
        )
        .bind(lane)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(summaries)
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        self.find_by_id_impl(&*self.pool, job_id).await
    }

    /// Finds a job by ID within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<Job>> {
        self.find_by_id_impl(&mut **tx, job_id).await
    }

    async fn find_by_id_impl<'e, E>(&self, executor: E, job_id: JobId) -> Result<Option<Job>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let job = sqlx::query_as::<_, Job>(
            r"
            SELECT id, lane, payload, state, attempts, max_attempts, next_run_at,
                   created_at, leased_at, completed_at, failed_at, last_error
            FROM jobs
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

        Ok(job)
    }

    /// Returns jobs whose lease predates `leased_before` to the queue.
    ///
    /// Used after a worker process died mid-job. The attempt counter is kept
    /// because the handler may already have run, so a job whose final attempt
    /// was abandoned is failed instead of requeued.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_stale(
        &self,
        lane: &Lane,
        leased_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET state = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'delayed' END,
                next_run_at = CASE WHEN attempts >= max_attempts THEN next_run_at ELSE $3 END,
                failed_at = CASE WHEN attempts >= max_attempts THEN $3 ELSE failed_at END,
                leased_at = NULL,
                last_error = COALESCE(last_error, 'lease expired')
            WHERE lane = $1 AND state = 'active' AND leased_at < $2
            ",
        )
        .bind(lane)
        .bind(leased_before)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn ensure_transitioned(&self, rows: u64, lease: Lease, to: JobState) -> Result<()> {
        if rows > 0 {
            return Ok(());
        }

        let job_id = lease.job_id;
        match self.find_by_id(job_id).await? {
            Some(job) if job.state == JobState::Active => Err(CoreError::LeaseConflict { job_id }),
            Some(job) => Err(CoreError::InvalidTransition { job_id, from: job.state, to }),
            None => Err(CoreError::NotFound(format!("job {job_id} not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_exposes_shared_pool() {
        let pool = Arc::new(PgPool::connect_lazy("postgresql://test").unwrap());
        let repository = Repository::new(pool.clone());

        assert!(Arc::ptr_eq(&repository.pool(), &pool));
    }

    #[tokio::test]
    async fn lease_on_closed_pool_is_unavailable() {
        let pool = Arc::new(PgPool::connect_lazy("postgresql://test").unwrap());
        pool.close().await;
        let repository = Repository::new(pool);

        let err = repository.lease_next(&Lane::bulk_sms(), Utc::now()).await.unwrap_err();

        assert!(err.is_unavailable(), "unexpected error: {err}");
    }
}
