//! Worker pool management with structured concurrency.
//!
//! Spawns a fixed number of workers per lane, tracks their handles and
//! drains them within a bounded window on shutdown.

use std::{sync::Arc, time::Duration};

use courier_core::Lane;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DispatchError, Result},
    worker::{DispatchWorker, WorkerContext},
};

/// Worker count for one lane together with the context its workers share.
pub(crate) struct LaneWorkers {
    pub ctx: WorkerContext,
    pub worker_count: usize,
}

struct WorkerHandle {
    lane: Lane,
    worker_id: usize,
    handle: JoinHandle<Result<()>>,
}

/// Supervised set of dispatch workers across all lanes.
pub struct WorkerPool {
    lanes: Vec<LaneWorkers>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub(crate) fn new(
        lanes: Vec<LaneWorkers>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { lanes, stats, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns every configured worker.
    ///
    /// Returns immediately; workers run until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if workers are already running.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DispatchError::configuration("worker pool already spawned"));
        }

        let total: usize = self.lanes.iter().map(|lane| lane.worker_count).sum();
        info!(worker_count = total, lanes = self.lanes.len(), "spawning dispatch workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = total;
        }

        for lane in &self.lanes {
            for worker_id in 0..lane.worker_count {
                let worker =
                    DispatchWorker::new(worker_id, lane.ctx.clone(), self.cancellation_token.clone());
                let lane_name = lane.ctx.lane.clone();
                let span_lane = lane_name.clone();

                let handle = tokio::spawn(async move {
                    let result = worker.run().await;

                    if let Err(ref error) = result {
                        error!(
                            worker_id,
                            lane = %span_lane,
                            error = %error,
                            "dispatch worker terminated with error"
                        );
                    }

                    result
                });

                self.worker_handles.push(WorkerHandle { lane: lane_name, worker_id, handle });
            }
        }

        info!(spawned_workers = self.worker_handles.len(), "all dispatch workers spawned");

        Ok(())
    }

    /// Stops leasing and waits for in-flight jobs to finish.
    ///
    /// Cancels every worker, then awaits them all within `timeout`. Workers
    /// that outlive the window keep running detached; their jobs stay
    /// `active` until stale-lease recovery picks them up.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` if the window elapses, or
    /// `DispatchError::WorkerPanic` for the first worker that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = timeout.as_millis(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();

        let shutdown_future = async move {
            let mut first_panic = None;

            for WorkerHandle { lane, worker_id, handle } in handles {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            lane = %lane,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            lane = %lane,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        first_panic.get_or_insert(DispatchError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;

            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_ms = timeout.as_millis(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|worker| !worker.handle.is_finished())
    }

    /// Number of spawned worker tasks.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count =
            self.worker_handles.iter().filter(|worker| !worker.handle.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
