//! Core domain models, clock and persistence for courier.
//!
//! Provides the job record and its lifecycle states, strongly-typed
//! identifiers, the error taxonomy shared by every crate, the injectable
//! [`Clock`], and the PostgreSQL repository that stores jobs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    EnqueueOptions, FileOperation, Job, JobId, JobKind, JobPayload, JobState, JobSummary, Lane,
    Lease, PruneOutcome, PrunePolicy, QueueStats, DEFAULT_MAX_ATTEMPTS, MAX_ENQUEUE_DELAY,
};
pub use time::{Clock, RealClock, TestClock};
