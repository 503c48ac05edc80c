//! Periodic job producers.
//!
//! A producer decides what work exists (rows changed in a spreadsheet, a
//! nightly export) and only ever talks to the queue through
//! [`QueueFacade::enqueue`]. [`ScheduledProducer`] runs one on a fixed
//! interval as an independent task.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{Clock, EnqueueOptions, JobPayload, Lane};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::DispatchError, queue::QueueFacade};

/// One job a producer wants enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedJob {
    /// Target lane.
    pub lane: Lane,
    /// Work to perform.
    pub payload: JobPayload,
    /// Delay and attempt ceiling.
    pub options: EnqueueOptions,
}

impl ProducedJob {
    /// Job with default options.
    pub fn new(lane: Lane, payload: JobPayload) -> Self {
        Self { lane, payload, options: EnqueueOptions::default() }
    }
}

/// Source of jobs polled on a schedule.
#[async_trait]
pub trait Produce: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Jobs to enqueue this tick.
    async fn produce(&self) -> anyhow::Result<Vec<ProducedJob>>;
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs accepted by the queue.
    pub enqueued: usize,
    /// Jobs the queue rejected.
    pub rejected: usize,
    /// The queue stopped accepting during this tick.
    pub queue_closed: bool,
}

/// Runs a [`Produce`] implementation every `interval`.
pub struct ScheduledProducer<P> {
    producer: Arc<P>,
    facade: Arc<QueueFacade>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl<P: Produce> ScheduledProducer<P> {
    /// Creates a scheduled producer. Nothing runs until [`Self::spawn`] or
    /// [`Self::tick`].
    pub fn new(
        producer: Arc<P>,
        facade: Arc<QueueFacade>,
        interval: Duration,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { producer, facade, interval, clock, cancellation_token }
    }

    /// Starts the schedule on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Ticks immediately, then every `interval`, until cancelled or the queue
    /// closes.
    pub async fn run(&self) {
        info!(
            producer = self.producer.name(),
            interval_ms = self.interval.as_millis(),
            "scheduled producer starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if self.tick().await.queue_closed {
                info!(producer = self.producer.name(), "queue closed, producer stopping");
                break;
            }

            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(producer = self.producer.name(), "scheduled producer stopped");
    }

    /// Runs the producer once and enqueues what it returns.
    ///
    /// Producer failures are logged and skipped; the next tick tries again.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let jobs = match self.producer.produce().await {
            Ok(jobs) => jobs,
            Err(error) => {
                error!(producer = self.producer.name(), error = %error, "producer failed");
                return report;
            },
        };

        for job in jobs {
            match self.facade.enqueue(job.lane.clone(), job.payload, job.options).await {
                Ok(job_id) => {
                    debug!(producer = self.producer.name(), job_id = %job_id, lane = %job.lane, "produced job");
                    report.enqueued += 1;
                },
                Err(DispatchError::QueueClosed) => {
                    report.queue_closed = true;
                    break;
                },
                Err(error) => {
                    warn!(
                        producer = self.producer.name(),
                        lane = %job.lane,
                        error = %error,
                        "queue rejected produced job"
                    );
                    report.rejected += 1;
                },
            }
        }

        report
    }
}
