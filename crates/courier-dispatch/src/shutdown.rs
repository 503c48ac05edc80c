//! Ordered process shutdown.
//!
//! On a termination signal the orchestrator walks a fixed sequence: stop
//! taking requests and new jobs, drain the workers, close the queue facade,
//! release the store, then pause briefly so buffered logs reach their sink.
//! Every step runs even if an earlier one failed.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use courier_core::Clock;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{engine::DispatchEngine, queue::QueueFacade, storage::JobStore};

/// Default pause at the end of shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// Default wait for the listener to finish open requests.
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(10);

/// A running request listener: the token that stops it and its task.
pub struct ListenerHandle {
    /// Cancelling this starts the listener's graceful shutdown.
    pub token: CancellationToken,
    /// Resolves once the listener has stopped.
    pub task: JoinHandle<anyhow::Result<()>>,
}

/// One step of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Stop the HTTP listener and reject new jobs.
    CloseListener,
    /// Wait for in-flight handlers.
    DrainWorkers,
    /// Drop the facade's store handle.
    CloseQueue,
    /// Release the store's connections.
    CloseStore,
    /// Final pause.
    GracePeriod,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CloseListener => "close_listener",
            Self::DrainWorkers => "drain_workers",
            Self::CloseQueue => "close_queue",
            Self::CloseStore => "close_store",
            Self::GracePeriod => "grace_period",
        };
        f.write_str(name)
    }
}

/// How one step went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Which step.
    pub step: ShutdownStep,
    /// Error message if the step failed.
    pub result: Result<(), String>,
    /// Time spent in the step.
    pub elapsed: Duration,
}

/// Every step of a completed shutdown, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Step results.
    pub steps: Vec<StepReport>,
}

impl ShutdownReport {
    /// Whether every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|step| step.result.is_ok())
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|step| step.result.is_err())
    }
}

/// Result of calling [`ShutdownOrchestrator::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// This call ran the sequence.
    Completed(ShutdownReport),
    /// Another call already started it; nothing was done.
    AlreadyRequested,
}

/// Coordinates the shutdown sequence.
pub struct ShutdownOrchestrator {
    listener: Mutex<Option<ListenerHandle>>,
    engine: Mutex<Option<DispatchEngine>>,
    facade: Arc<QueueFacade>,
    store: Arc<dyn JobStore>,
    grace_period: Duration,
    listener_timeout: Duration,
    clock: Arc<dyn Clock>,
    requested: AtomicBool,
}

impl ShutdownOrchestrator {
    /// Orchestrator for a process without a listener or running engine.
    pub fn new(facade: Arc<QueueFacade>, store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            listener: Mutex::new(None),
            engine: Mutex::new(None),
            facade,
            store,
            grace_period: DEFAULT_GRACE_PERIOD,
            listener_timeout: DEFAULT_LISTENER_TIMEOUT,
            clock,
            requested: AtomicBool::new(false),
        }
    }

    /// Hands over the engine to drain.
    #[must_use]
    pub fn with_engine(mut self, engine: DispatchEngine) -> Self {
        self.engine = Mutex::new(Some(engine));
        self
    }

    /// Hands over the request listener to stop first.
    #[must_use]
    pub fn with_listener(mut self, listener: ListenerHandle) -> Self {
        self.listener = Mutex::new(Some(listener));
        self
    }

    /// Overrides the final pause.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Bounds the wait for the listener to stop. A listener still running
    /// afterwards is aborted and the step reported as failed.
    #[must_use]
    pub fn with_listener_timeout(mut self, timeout: Duration) -> Self {
        self.listener_timeout = timeout;
        self
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Runs the shutdown sequence once.
    ///
    /// Later calls return [`ShutdownOutcome::AlreadyRequested`] immediately,
    /// whether the first run is still in progress or finished.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        if self.requested.swap(true, Ordering::AcqRel) {
            warn!("shutdown already requested, ignoring repeated signal");
            return ShutdownOutcome::AlreadyRequested;
        }

        info!("shutdown sequence starting");
        let mut report = ShutdownReport::default();

        let result = self.close_listener().await;
        report.steps.push(self.finish(ShutdownStep::CloseListener, result.0, result.1));

        let started = self.clock.now();
        let result = self.drain_workers().await;
        report.steps.push(self.finish(ShutdownStep::DrainWorkers, started, result));

        let started = self.clock.now();
        self.facade.close().await;
        report.steps.push(self.finish(ShutdownStep::CloseQueue, started, Ok(())));

        let started = self.clock.now();
        self.store.close().await;
        report.steps.push(self.finish(ShutdownStep::CloseStore, started, Ok(())));

        let started = self.clock.now();
        self.clock.sleep(self.grace_period).await;
        report.steps.push(self.finish(ShutdownStep::GracePeriod, started, Ok(())));

        info!(
            clean = report.is_clean(),
            failed_steps = report.failures().count(),
            "shutdown sequence finished"
        );

        ShutdownOutcome::Completed(report)
    }

    async fn close_listener(&self) -> (Instant, Result<(), String>) {
        let started = self.clock.now();
        self.facade.stop_accepting();

        let Some(listener) = self.listener.lock().await.take() else {
            return (started, Ok(()));
        };

        let ListenerHandle { token, mut task } = listener;
        token.cancel();
        let result = match tokio::time::timeout(self.listener_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => Err(format!("listener exited with error: {error:#}")),
            Ok(Err(join_error)) => Err(format!("listener task failed: {join_error}")),
            Err(_elapsed) => {
                task.abort();
                Err(format!("listener did not stop within {:?}", self.listener_timeout))
            },
        };

        (started, result)
    }

    async fn drain_workers(&self) -> Result<(), String> {
        let Some(engine) = self.engine.lock().await.take() else {
            return Ok(());
        };

        engine.shutdown().await.map_err(|error| error.to_string())
    }

    fn finish(&self, step: ShutdownStep, started: Instant, result: Result<(), String>) -> StepReport {
        let elapsed = self.clock.now().saturating_duration_since(started);

        match &result {
            Ok(()) => info!(step = %step, elapsed_ms = elapsed.as_millis(), "shutdown step finished"),
            Err(error) => error!(step = %step, error = %error, "shutdown step failed"),
        }

        StepReport { step, result, elapsed }
    }
}
