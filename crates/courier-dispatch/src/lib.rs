//! Rate-limited background job dispatch.
//!
//! This crate drains the persistent job queue with a bounded pool of async
//! workers per lane. Throttled lanes hand out at most one permit per fixed
//! interval no matter how many workers run, failed attempts are rescheduled
//! with exponential backoff, and shutdown drains in-flight work in a fixed
//! order.
//!
//! # Architecture
//!
//! Each worker owns a poll loop over one lane:
//!
//! 1. **Lease** - take the oldest due job through the lane's lease window
//! 2. **Throttle** - wait for the lane's rate permit, if it has one
//! 3. **Invoke** - run the registered handler under a timeout
//! 4. **Record** - complete, reschedule or fail the job via the retry policy
//!
//! Producers never see workers; they only call [`QueueFacade::enqueue`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{Clock, RealClock};
//! use courier_dispatch::{
//!     storage::memory::InMemoryJobStore, DispatchEngine, DispatchError, EngineConfig,
//!     HandlerRegistry,
//! };
//!
//! # async fn example() -> std::result::Result<(), DispatchError> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let store = Arc::new(InMemoryJobStore::new(clock.clone()));
//! let mut engine =
//!     DispatchEngine::new(store, HandlerRegistry::new(), EngineConfig::default(), clock)?;
//!
//! engine.start().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod handler;
pub mod lease;
pub mod producer;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod sender;
pub mod shutdown;
pub mod storage;
pub mod worker;
pub mod worker_pool;

// Re-export main public API
pub use engine::{DispatchEngine, EngineConfig, EngineStats, LaneConfig, MaintenanceReport};
pub use error::{DispatchError, ErrorCategory, HandlerError, Result};
pub use handler::{FnHandler, HandlerRegistry, JobContext, JobHandler, TracingHandler};
pub use queue::{CancelOutcome, QueueFacade};
pub use rate_limit::RateLimiter;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use shutdown::{ShutdownOrchestrator, ShutdownOutcome, ShutdownReport};
pub use storage::{JobStore, PostgresJobStore};
pub use worker::JobOutcome;

/// Default number of workers per lane.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default cap on leases per lane per rolling minute.
pub const DEFAULT_LEASES_PER_MINUTE: u32 = 100;
