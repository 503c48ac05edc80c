//! Courier dispatch service.
//!
//! Main entry point. Connects the job store, starts the dispatch engine and
//! the HTTP listener, then runs the ordered shutdown sequence on CTRL+C or
//! SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{serve, shutdown_signal, AppState, Config};
use courier_core::{storage::Storage, Clock, JobKind, RealClock};
use courier_dispatch::{
    sender::{SendMessageHandler, TracingSender},
    shutdown::ListenerHandle,
    DispatchEngine, HandlerRegistry, PostgresJobStore, QueueFacade, ShutdownOrchestrator,
    ShutdownOutcome, TracingHandler,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Headroom over the request timeout before a stopping listener is aborted.
const LISTENER_STOP_SLACK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("Starting courier dispatch service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        worker_count = config.worker_count,
        bulk_sms_interval_ms = config.bulk_sms_interval_ms,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool));
    storage.migrate().await.context("Failed to run database migrations")?;
    info!("Database ready");

    let store = Arc::new(PostgresJobStore::new(storage, clock.clone()));
    let facade = Arc::new(
        QueueFacade::new(store.clone(), config.to_prune_policy())
            .with_default_max_attempts(config.max_attempts),
    );

    let registry = HandlerRegistry::new()
        .with_handler(JobKind::SendMessage, Arc::new(SendMessageHandler::new(Arc::new(TracingSender))))
        .with_handler(JobKind::ProcessFile, Arc::new(TracingHandler));

    let mut engine =
        DispatchEngine::new(store.clone(), registry, config.to_engine_config(), clock.clone())
            .context("Invalid dispatch configuration")?;
    engine.start().await.context("Failed to start dispatch engine")?;

    let addr = config.parse_server_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let state = AppState::new(facade.clone(), clock.clone())
        .with_request_timeout(Duration::from_secs(config.request_timeout));
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let token = token.clone();
        async move { serve(listener, state, token).await.context("HTTP server failed") }
    });

    info!(addr = %addr, "courier is ready to accept jobs");

    let orchestrator = ShutdownOrchestrator::new(facade, store, clock)
        .with_listener(ListenerHandle { token, task })
        .with_engine(engine)
        .with_listener_timeout(Duration::from_secs(config.request_timeout) + LISTENER_STOP_SLACK)
        .with_grace_period(config.shutdown_grace_period());

    shutdown_signal().await;

    match orchestrator.shutdown().await {
        ShutdownOutcome::Completed(report) if report.is_clean() => {
            info!("courier shutdown complete");
        },
        ShutdownOutcome::Completed(report) => {
            for step in report.failures() {
                error!(step = %step.step, "shutdown step did not finish cleanly");
            }
            warn!("courier shutdown finished with errors");
        },
        ShutdownOutcome::AlreadyRequested => {},
    }

    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured filter and
/// `LOG_FORMAT=json` switches to structured output.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("Invalid log filter")?;

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    }

    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < config.database_connect_retries => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = config.database_connect_retries,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
