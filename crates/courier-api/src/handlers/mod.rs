//! HTTP request handlers for the courier API.
//!
//! Every handler goes through the [`QueueFacade`](courier_dispatch::QueueFacade)
//! held in [`AppState`](crate::AppState) and reports failures with the JSON
//! error body defined in [`error`].

pub mod error;
pub mod health;
pub mod jobs;

pub use error::{ApiError, ErrorDetail, ErrorResponse};
pub use health::{health_check, readiness_check};
pub use jobs::{cancel_job, enqueue_job, find_job, lane_stats, list_jobs, prune_lane};
