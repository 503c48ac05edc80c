//! Health check handlers for service monitoring.
//!
//! `/health` only proves the process answers. `/ready` also asks the job
//! store, so orchestrators stop routing producers to an instance whose
//! database is gone or whose queue is shutting down.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::Clock;
use courier_dispatch::QueueFacade;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthChecks>,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Job store connectivity
    pub store: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Health service that encapsulates the clock for testable health checks.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Liveness report. Touches nothing external.
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            timestamp: self.clock.now_utc(),
            checks: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Readiness report including a store round trip.
    pub async fn readiness(&self, queue: &QueueFacade) -> HealthResponse {
        debug!("Performing readiness check");

        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();
        let store = self.check_store(queue).await;
        let elapsed = self.clock.now().saturating_duration_since(start_time);

        let status = match store.status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        HealthResponse {
            status,
            timestamp,
            checks: Some(HealthChecks {
                store: ComponentHealth {
                    status: store.status,
                    message: store.message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            }),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_store(&self, queue: &QueueFacade) -> StoreHealth {
        if !queue.is_accepting() {
            return StoreHealth {
                status: ComponentStatus::Down,
                message: Some("queue is shutting down".to_string()),
            };
        }

        match queue.health_check().await {
            Ok(()) => {
                debug!("Store health check passed");
                StoreHealth { status: ComponentStatus::Up, message: None }
            },
            Err(e) => {
                error!(error = %e, "Store health check failed");
                StoreHealth { status: ComponentStatus::Down, message: Some(e.to_string()) }
            },
        }
    }
}

struct StoreHealth {
    status: ComponentStatus,
    message: Option<String>,
}

/// Liveness endpoint handler.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let response = HealthService::new(app_state.clock.clone()).liveness();

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness endpoint handler. 503 when the store cannot be reached.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    let response = HealthService::new(app_state.clock.clone()).readiness(&app_state.queue).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "Readiness check completed");

    (status_code, Json(response)).into_response()
}
