//! Outbound message sending.
//!
//! The messaging provider is opaque: it reports failures with its own codes
//! and says whether trying again could help. [`SendMessageHandler`] turns
//! that into the handler error taxonomy.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::JobPayload;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    error::HandlerError,
    handler::{JobContext, JobHandler},
};

/// Failure reported by a message provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sender error {code}: {message}")]
pub struct SenderError {
    /// Provider-specific error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether a later attempt could succeed.
    pub retryable: bool,
}

impl SenderError {
    /// Failure worth retrying, such as a provider outage.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), retryable: true }
    }

    /// Failure that will repeat on every attempt, such as an invalid number.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), retryable: false }
    }
}

impl From<SenderError> for HandlerError {
    fn from(err: SenderError) -> Self {
        if err.retryable {
            Self::transient(err.to_string())
        } else {
            Self::terminal(err.to_string())
        }
    }
}

/// Delivers one message to one recipient.
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Sends `content` to `recipient`.
    async fn send(&self, recipient: &str, content: &str) -> Result<(), SenderError>;
}

/// Handler for `send_message` jobs.
///
/// Workers acquire the lane's rate permit before calling it, so every call
/// here is one throttled send.
pub struct SendMessageHandler<S> {
    sender: Arc<S>,
}

impl<S: MessageSender> SendMessageHandler<S> {
    /// Creates a handler delivering through `sender`.
    pub fn new(sender: Arc<S>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S: MessageSender> JobHandler for SendMessageHandler<S> {
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::SendMessage { recipient, content } = &ctx.payload else {
            return Err(HandlerError::terminal(format!(
                "send_message handler cannot process {} payloads",
                ctx.payload.kind()
            )));
        };

        debug!(job_id = %ctx.job_id, attempt = ctx.attempt, "sending message");
        self.sender.send(recipient, content).await?;
        Ok(())
    }
}

/// Sender that only logs. Used when no provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSender;

#[async_trait]
impl MessageSender for TracingSender {
    async fn send(&self, recipient: &str, content: &str) -> Result<(), SenderError> {
        info!(recipient = %recipient, content_len = content.len(), "dry-run message send");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{EnqueueOptions, FileOperation, Job, Lane};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeSender {
        sent: Mutex<Vec<(String, String)>>,
        fail_with: Option<SenderError>,
    }

    #[async_trait]
    impl MessageSender for FakeSender {
        async fn send(&self, recipient: &str, content: &str) -> Result<(), SenderError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.sent.lock().await.push((recipient.to_string(), content.to_string()));
            Ok(())
        }
    }

    fn context(payload: JobPayload) -> JobContext {
        let job =
            Job::new(Lane::bulk_sms(), payload, EnqueueOptions::default(), Utc::now()).unwrap();
        JobContext::from_job(&job)
    }

    #[tokio::test]
    async fn delivers_message_payloads() {
        let sender = Arc::new(FakeSender::default());
        let handler = SendMessageHandler::new(sender.clone());

        handler.handle(&context(JobPayload::send_message("+15550100", "A"))).await.unwrap();

        assert_eq!(
            *sender.sent.lock().await,
            vec![("+15550100".to_string(), "A".to_string())]
        );
    }

    #[tokio::test]
    async fn sender_errors_keep_their_retryability() {
        let transient = SendMessageHandler::new(Arc::new(FakeSender {
            fail_with: Some(SenderError::transient("30001", "queue overflow")),
            ..Default::default()
        }));
        let permanent = SendMessageHandler::new(Arc::new(FakeSender {
            fail_with: Some(SenderError::permanent("21211", "invalid 'To' number")),
            ..Default::default()
        }));
        let ctx = context(JobPayload::send_message("+15550100", "A"));

        let err = transient.handle(&ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("30001"));

        assert!(!permanent.handle(&ctx).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn wrong_payload_is_terminal() {
        let handler = SendMessageHandler::new(Arc::new(TracingSender));
        let ctx = context(JobPayload::process_file("a.csv", FileOperation::Delete));

        let err = handler.handle(&ctx).await.unwrap_err();

        assert!(!err.is_retryable());
    }
}
