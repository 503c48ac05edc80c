//! Job submission and inspection endpoints.
//!
//! Thin adapters over [`QueueFacade`](courier_dispatch::QueueFacade): parse
//! the lane or job id from the path, call the facade, map the outcome to a
//! status code.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::{
    EnqueueOptions, Job, JobId, JobPayload, JobSummary, Lane, QueueStats, MAX_ENQUEUE_DELAY,
};
use courier_dispatch::CancelOutcome;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{handlers::error::ApiError, AppState};

/// Page size of `GET /lanes/{lane}/jobs` when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Body of `POST /lanes/{lane}/jobs`.
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Operation-specific data, tagged by `kind`
    pub payload: JobPayload,
    /// Delay before the job becomes eligible
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// Attempt ceiling, the queue default when absent
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    fn options(&self) -> Result<EnqueueOptions, ApiError> {
        let delay = Duration::from_millis(self.delay_ms.unwrap_or(0));
        if delay > MAX_ENQUEUE_DELAY {
            return Err(ApiError::BadRequest(format!(
                "delay_ms must not exceed {}",
                MAX_ENQUEUE_DELAY.as_millis()
            )));
        }

        let options = EnqueueOptions::default().with_delay(delay);
        Ok(match self.max_attempts {
            Some(max_attempts) => options.with_max_attempts(max_attempts),
            None => options,
        })
    }
}

/// Response from a successful enqueue.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// Identifier of the new job
    pub job_id: JobId,
}

/// Per-state counts of one lane.
#[derive(Debug, Serialize)]
pub struct LaneStatsResponse {
    /// Lane name
    pub lane: Lane,
    /// Counts per state
    #[serde(flatten)]
    pub stats: QueueStats,
    /// Jobs in any state
    pub total: u64,
}

/// Query string of the listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Page size, capped by the facade
    pub limit: Option<usize>,
}

/// Newest jobs of one lane.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Lane name
    pub lane: Lane,
    /// Newest first
    pub jobs: Vec<JobSummary>,
}

/// Result of a prune request.
#[derive(Debug, Serialize, Deserialize)]
pub struct PruneResponse {
    /// Jobs deleted
    pub removed: u64,
}

fn parse_lane(raw: &str) -> Result<Lane, ApiError> {
    raw.parse::<Lane>().map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Enqueues a job in a lane.
///
/// # Errors
///
/// - 400: invalid lane, payload or options
/// - 503: queue closed or store unavailable
#[instrument(name = "enqueue_job", skip(state, request), fields(lane = %lane))]
pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(lane): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Response, ApiError> {
    let lane = parse_lane(&lane)?;
    let options = request.options()?;
    let kind = request.payload.kind();

    let job_id = state.queue.enqueue(lane.clone(), request.payload, options).await?;

    info!(job_id = %job_id, lane = %lane, kind = %kind, "job accepted");
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })).into_response())
}

/// Per-state counts for a lane.
///
/// # Errors
///
/// - 400: invalid lane
/// - 503: queue closed or store unavailable
#[instrument(name = "lane_stats", skip(state))]
pub async fn lane_stats(
    State(state): State<AppState>,
    Path(lane): Path<String>,
) -> Result<Json<LaneStatsResponse>, ApiError> {
    let lane = parse_lane(&lane)?;
    let stats = state.queue.stats(&lane).await?;
    let total = stats.total();

    Ok(Json(LaneStatsResponse { lane, stats, total }))
}

/// Newest jobs in a lane.
///
/// # Errors
///
/// - 400: invalid lane
/// - 503: queue closed or store unavailable
#[instrument(name = "list_jobs", skip(state))]
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(lane): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let lane = parse_lane(&lane)?;
    let jobs = state.queue.list_recent(&lane, query.limit.unwrap_or(DEFAULT_LIST_LIMIT)).await?;

    Ok(Json(ListResponse { lane, jobs }))
}

/// Deletes old completed jobs in a lane.
///
/// # Errors
///
/// - 400: invalid lane
/// - 503: queue closed or store unavailable
#[instrument(name = "prune_lane", skip(state))]
pub async fn prune_lane(
    State(state): State<AppState>,
    Path(lane): Path<String>,
) -> Result<Json<PruneResponse>, ApiError> {
    let lane = parse_lane(&lane)?;
    let outcome = state.queue.prune_completed(&lane).await?;

    Ok(Json(PruneResponse { removed: outcome.removed }))
}

/// Full job record.
///
/// # Errors
///
/// - 404: unknown job
/// - 503: queue closed or store unavailable
#[instrument(name = "find_job", skip(state))]
pub async fn find_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job_id = JobId(job_id);

    match state.queue.find_job(job_id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound(format!("job {job_id} not found"))),
    }
}

/// Cancels a job that has not been leased.
///
/// # Errors
///
/// - 404: unknown job
/// - 409: job is active or finished
/// - 503: queue closed or store unavailable
#[instrument(name = "cancel_job", skip(state))]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let job_id = JobId(job_id);

    match state.queue.cancel(job_id).await? {
        CancelOutcome::Cancelled => Ok(StatusCode::NO_CONTENT),
        CancelOutcome::NotCancellable(job_state) => {
            warn!(job_id = %job_id, state = %job_state, "cancel rejected");
            Err(ApiError::Conflict(format!("job {job_id} is {job_state} and cannot be cancelled")))
        },
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!("job {job_id} not found"))),
    }
}
