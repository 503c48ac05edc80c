//! Job handlers with scripted behavior and recorded invocations.
//!
//! Timestamps come from the injected clock, so tests driven by a
//! [`TestClock`](courier_core::TestClock) can assert exact spacing between
//! invocations.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use async_trait::async_trait;
use courier_core::{Clock, JobId};
use courier_dispatch::{HandlerError, JobContext, JobHandler};
use tokio::sync::{Mutex, Notify, Semaphore};

/// One recorded handler call.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Context the handler received.
    pub ctx: JobContext,
    /// Clock reading at the start of the call.
    pub at: Instant,
}

/// Handler that records every call and returns scripted results.
///
/// Results are consumed in order; once the script runs out every call
/// succeeds, unless a fallback is set.
#[derive(Debug)]
pub struct ScriptedHandler {
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<Result<(), HandlerError>>>,
    fallback: Result<(), HandlerError>,
    invocations: Mutex<Vec<Invocation>>,
    notify: Notify,
}

impl ScriptedHandler {
    /// Handler that always succeeds.
    pub fn succeeding(clock: Arc<dyn Clock>) -> Self {
        Self::with_fallback(clock, Ok(()))
    }

    /// Handler that fails every call with `error`.
    pub fn failing(clock: Arc<dyn Clock>, error: HandlerError) -> Self {
        Self::with_fallback(clock, Err(error))
    }

    fn with_fallback(clock: Arc<dyn Clock>, fallback: Result<(), HandlerError>) -> Self {
        Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            fallback,
            invocations: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Queues results for the next calls.
    #[must_use]
    pub fn then(mut self, results: impl IntoIterator<Item = Result<(), HandlerError>>) -> Self {
        self.script.get_mut().extend(results);
        self
    }

    /// Every call so far, in order.
    pub async fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().await.clone()
    }

    /// Number of calls so far.
    pub async fn call_count(&self) -> usize {
        self.invocations.lock().await.len()
    }

    /// Calls made for one job.
    pub async fn calls_for(&self, job_id: JobId) -> Vec<Invocation> {
        self.invocations.lock().await.iter().filter(|call| call.ctx.job_id == job_id).cloned().collect()
    }

    /// Waits until at least `count` calls have been recorded.
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.call_count().await >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        self.invocations.lock().await.push(Invocation { ctx: ctx.clone(), at: self.clock.now() });
        self.notify.notify_waiters();

        self.script.lock().await.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Handler that blocks until the test opens the gate.
///
/// Useful for holding a job `active` while shutdown runs.
#[derive(Debug)]
pub struct GateHandler {
    gate: Semaphore,
    started: Notify,
    entered: Mutex<Vec<JobId>>,
}

impl GateHandler {
    /// Creates a closed gate.
    pub fn new() -> Self {
        Self { gate: Semaphore::new(0), started: Notify::new(), entered: Mutex::new(Vec::new()) }
    }

    /// Lets `count` blocked or future calls through.
    pub fn open(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Waits until some call is blocked on the gate.
    pub async fn wait_until_entered(&self) {
        loop {
            let started = self.started.notified();
            if !self.entered.lock().await.is_empty() {
                return;
            }
            started.await;
        }
    }

    /// Jobs that have reached the gate.
    pub async fn entered(&self) -> Vec<JobId> {
        self.entered.lock().await.clone()
    }
}

impl Default for GateHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for GateHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        self.entered.lock().await.push(ctx.job_id);
        self.started.notify_waiters();

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| HandlerError::transient("gate closed"))?;
        permit.forget();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Job, Lane, TestClock};

    use super::*;
    use crate::fixtures::JobBuilder;

    fn context() -> JobContext {
        let job: Job = JobBuilder::message("A").lane(Lane::bulk_sms()).build(chrono::Utc::now());
        JobContext::from_job(&job)
    }

    #[tokio::test]
    async fn scripted_results_are_consumed_in_order() {
        let clock = TestClock::new();
        let handler = ScriptedHandler::succeeding(Arc::new(clock.clone()))
            .then([Err(HandlerError::transient("503"))]);
        let ctx = context();

        assert!(handler.handle(&ctx).await.is_err());
        clock.advance(std::time::Duration::from_secs(2));
        assert!(handler.handle(&ctx).await.is_ok());

        let calls = handler.invocations().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].at.duration_since(calls[0].at), std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn gate_blocks_until_opened() {
        let handler = Arc::new(GateHandler::new());
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(&context()).await })
        };

        handler.wait_until_entered().await;
        assert!(!task.is_finished());

        handler.open(1);
        assert!(task.await.unwrap().is_ok());
    }
}
