//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! The server stops accepting connections when its cancellation token fires
//! and finishes in-flight requests before `serve` returns.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use courier_core::Clock;
use courier_dispatch::QueueFacade;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::handlers;

/// Request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Producer-facing queue API
    pub queue: Arc<QueueFacade>,
    /// Clock for response timestamps
    pub clock: Arc<dyn Clock>,
    request_timeout: Duration,
}

impl AppState {
    /// State with the default request timeout.
    pub fn new(queue: Arc<QueueFacade>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock, request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use courier_api::{create_router, AppState};
/// use courier_core::{PrunePolicy, RealClock};
/// use courier_dispatch::{storage::memory::InMemoryJobStore, QueueFacade};
///
/// let clock = Arc::new(RealClock::new());
/// let store = Arc::new(InMemoryJobStore::new(clock.clone()));
/// let queue = Arc::new(QueueFacade::new(store, PrunePolicy::default()));
/// let app = create_router(AppState::new(queue, clock));
/// ```
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    let lane_routes = Router::new()
        .route("/lanes/{lane}/jobs", post(handlers::enqueue_job).get(handlers::list_jobs))
        .route("/lanes/{lane}/stats", get(handlers::lane_stats))
        .route("/lanes/{lane}/prune", post(handlers::prune_lane));

    let job_routes = Router::new()
        .route("/jobs/{id}", get(handlers::find_job).delete(handlers::cancel_job));

    let request_timeout = state.request_timeout;

    Router::new()
        .merge(health_routes)
        .merge(lane_routes)
        .merge(job_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware to inject request ID into all responses.
///
/// Adds X-Request-Id header for tracing requests across services.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Binds `addr` and serves until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the port is in use or the listener fails.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Serves on an already bound listener until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if accepting connections fails.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            warn!("HTTP server draining in-flight requests");
        })
        .await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
