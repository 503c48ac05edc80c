//! Error types and result handling for job persistence.
//!
//! Separates transport failures (the store cannot be reached at all) from
//! logical failures such as a lost lease or an illegal state change, so
//! callers can decide whether to back off or give up.

use thiserror::Error;

use crate::models::{JobId, JobState};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for store and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The job store could not be reached.
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// Database operation failed for a reason other than connectivity.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied an invalid value.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The job is active under a newer lease than the caller's.
    #[error("lease conflict on job {job_id}")]
    LeaseConflict {
        /// Job whose lease moved on.
        job_id: JobId,
    },

    /// Requested state change is not legal from the job's current state.
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job being updated.
        job_id: JobId,
        /// State found in the store.
        from: JobState,
        /// State that was requested.
        to: JobState,
    },
}

impl CoreError {
    /// Whether the failure is a connectivity problem worth backing off on.
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Whether the error only means "somebody else got there first".
    ///
    /// Leasing never conflicts: the losing worker of a claim race sees no
    /// due job. Conflicts come from outcome writes on a job that moved on.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. } | Self::InvalidTransition { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested job not found".to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::StoreUnavailable(err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::InvalidInput(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Database(format!("unique constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_map_to_unavailable() {
        assert!(CoreError::from(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(CoreError::from(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!CoreError::from(sqlx::Error::RowNotFound).is_unavailable());
    }

    #[test]
    fn conflicts_are_identified() {
        let job_id = JobId::new();
        assert!(CoreError::LeaseConflict { job_id }.is_conflict());
        assert!(CoreError::InvalidTransition {
            job_id,
            from: JobState::Completed,
            to: JobState::Failed
        }
        .is_conflict());
        assert!(!CoreError::NotFound("job".to_string()).is_conflict());
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = CoreError::InvalidTransition {
            job_id: JobId::new(),
            from: JobState::Waiting,
            to: JobState::Completed,
        };

        let message = err.to_string();
        assert!(message.contains("from waiting to completed"));
    }
}
