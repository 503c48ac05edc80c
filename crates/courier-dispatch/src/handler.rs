//! Job handlers and the registry that routes payloads to them.
//!
//! The registry is assembled once at startup, one handler per [`JobKind`],
//! and shared read-only by every worker afterwards.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use courier_core::{Job, JobId, JobKind, JobPayload, Lane};
use tracing::info;

use crate::error::HandlerError;

/// What a handler receives for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Job being processed.
    pub job_id: JobId,
    /// Lane the job was leased from.
    pub lane: Lane,
    /// 1-based number of this invocation.
    pub attempt: u32,
    /// Invocation ceiling for the job.
    pub max_attempts: u32,
    /// Operation-specific data.
    pub payload: JobPayload,
}

impl JobContext {
    /// Builds the context for a freshly leased job.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            lane: job.lane.clone(),
            attempt: u32::try_from(job.attempts).unwrap_or(0),
            max_attempts: u32::try_from(job.max_attempts).unwrap_or(0),
            payload: job.payload().clone(),
        }
    }

    /// Whether this invocation is the job's final chance.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Work performed for one kind of job.
///
/// Implementations classify their own failures: return
/// [`HandlerError::Transient`] for anything worth retrying and
/// [`HandlerError::Terminal`] for payloads that can never succeed.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Processes one job.
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Handler table keyed by job kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Handler for `kind`, if one is registered.
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Whether a handler exists for `kind`.
    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

/// Handler that records the job in the log and succeeds.
///
/// Stands in for file processing until a real importer is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHandler;

#[async_trait]
impl JobHandler for TracingHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        match &ctx.payload {
            JobPayload::ProcessFile { file_ref, operation } => {
                info!(
                    job_id = %ctx.job_id,
                    lane = %ctx.lane,
                    file_ref = %file_ref,
                    operation = %operation,
                    "file job processed"
                );
            },
            JobPayload::SendMessage { recipient, .. } => {
                info!(
                    job_id = %ctx.job_id,
                    lane = %ctx.lane,
                    recipient = %recipient,
                    "message job processed"
                );
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{EnqueueOptions, FileOperation};

    use super::*;

    #[tokio::test]
    async fn registry_routes_by_kind() {
        let registry = HandlerRegistry::new()
            .with_handler(JobKind::ProcessFile, Arc::new(TracingHandler))
            .with_handler(
                JobKind::SendMessage,
                Arc::new(FnHandler::new(|_ctx| async { Err(HandlerError::terminal("nope")) })),
            );

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(JobKind::SendMessage));

        let job = Job::new(
            Lane::bulk_sms(),
            JobPayload::send_message("+15550100", "A"),
            EnqueueOptions::default(),
            Utc::now(),
        )
        .unwrap();
        let handler = registry.get(job.kind()).unwrap();

        let result = handler.handle(&JobContext::from_job(&job)).await;
        assert_eq!(result, Err(HandlerError::terminal("nope")));
    }

    #[tokio::test]
    async fn tracing_handler_succeeds() {
        let mut job = Job::new(
            Lane::files(),
            JobPayload::process_file("imports/roster.csv", FileOperation::Import),
            EnqueueOptions::default(),
            Utc::now(),
        )
        .unwrap();
        job.attempts = 1;

        let ctx = JobContext::from_job(&job);
        assert_eq!(ctx.attempt, 1);
        assert!(!ctx.is_last_attempt());
        assert!(TracingHandler.handle(&ctx).await.is_ok());
    }

    #[test]
    fn empty_registry_has_no_handlers() {
        let registry = HandlerRegistry::new();

        assert!(registry.is_empty());
        assert!(registry.get(JobKind::ProcessFile).is_none());
        assert_eq!(format!("{registry:?}"), "HandlerRegistry { kinds: [] }");
    }
}
