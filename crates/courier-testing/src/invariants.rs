//! Invariant checks shared by integration and property tests.
//!
//! Each check returns an error describing the first violation so tests can
//! `?` them or wrap them in `prop_assert!`.

use std::{collections::HashSet, time::Duration};

use anyhow::{ensure, Result};
use courier_core::{Job, JobId, JobState};

/// Guarantees the dispatcher must uphold in every state.
pub struct Invariants;

impl Invariants {
    /// Attempts never exceed the job's ceiling, and only failed jobs may have
    /// used all of them without completing.
    pub fn attempts_bounded(jobs: &[Job]) -> Result<()> {
        for job in jobs {
            ensure!(
                job.attempts >= 0 && job.attempts <= job.max_attempts,
                "job {} has {} attempts with a ceiling of {}",
                job.id,
                job.attempts,
                job.max_attempts
            );
            ensure!(
                job.state != JobState::Completed || job.attempts > 0,
                "job {} completed without being invoked",
                job.id
            );
        }
        Ok(())
    }

    /// No job id was handed out twice.
    pub fn leased_once(leased: &[JobId]) -> Result<()> {
        let mut seen = HashSet::with_capacity(leased.len());
        for id in leased {
            ensure!(seen.insert(*id), "job {id} was leased more than once");
        }
        Ok(())
    }

    /// Leases came out in `(next_run_at, created_at)` order.
    pub fn leased_in_order(leased: &[Job]) -> Result<()> {
        for pair in leased.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            ensure!(
                (earlier.next_run_at, earlier.created_at) <= (later.next_run_at, later.created_at),
                "job {} was leased before older job {}",
                earlier.id,
                later.id
            );
        }
        Ok(())
    }

    /// Consecutive gaps are at least `interval` apart.
    pub fn spaced_by(gaps: &[Duration], interval: Duration) -> Result<()> {
        for (index, gap) in gaps.iter().enumerate() {
            ensure!(
                *gap >= interval,
                "gap {index} was {gap:?}, expected at least {interval:?}"
            );
        }
        Ok(())
    }

    /// Terminal jobs carry the timestamp of their terminal state, and failed
    /// jobs keep their error.
    pub fn terminal_jobs_stamped(jobs: &[Job]) -> Result<()> {
        for job in jobs {
            match job.state {
                JobState::Completed => {
                    ensure!(job.completed_at.is_some(), "completed job {} lacks completed_at", job.id);
                },
                JobState::Failed => {
                    ensure!(job.failed_at.is_some(), "failed job {} lacks failed_at", job.id);
                    ensure!(job.last_error.is_some(), "failed job {} lacks last_error", job.id);
                },
                JobState::Active => {
                    ensure!(job.leased_at.is_some(), "active job {} lacks leased_at", job.id);
                },
                JobState::Waiting | JobState::Delayed => {},
            }
        }
        Ok(())
    }
}
