//! Error types for job dispatch.
//!
//! Two families live here. [`DispatchError`] covers the machinery around a
//! job: the store, the facade, the worker pool. [`HandlerError`] is what a
//! job handler reports back, and its retryability drives the retry policy.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the store adapters, queue facade, workers and engine.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The job store could not be reached.
    #[error("job store unavailable: {message}")]
    StoreUnavailable {
        /// Transport failure description
        message: String,
    },

    /// The job store rejected or failed an operation.
    #[error("job store error: {message}")]
    Store {
        /// Store error description
        message: String,
    },

    /// A requested state change lost a race or is not legal.
    #[error("job conflict: {message}")]
    Conflict {
        /// Conflict description
        message: String,
    },

    /// Caller supplied an invalid lane, payload or option.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Validation failure description
        message: String,
    },

    /// The queue facade no longer accepts the requested call.
    #[error("queue is closed")]
    QueueClosed,

    /// Workers did not finish within the drain window.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Drain window that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker within its lane
        worker_id: usize,
        /// Join error text
        error: String,
    },

    /// Engine or lane configuration is unusable.
    #[error("invalid dispatch configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal dispatch error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DispatchError {
    /// Creates a store-unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Creates a generic store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the caller should back off and try again later.
    ///
    /// True for store unavailability only. A closed queue stays closed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Whether the error is a lost race on a job's state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<CoreError> for DispatchError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::StoreUnavailable(message) => Self::StoreUnavailable { message },
            CoreError::InvalidInput(message) => Self::InvalidInput { message },
            err @ (CoreError::LeaseConflict { .. } | CoreError::InvalidTransition { .. }) => {
                Self::Conflict { message: err.to_string() }
            },
            err @ (CoreError::Database(_) | CoreError::NotFound(_)) => {
                Self::Store { message: err.to_string() }
            },
        }
    }
}

/// Outcome reported by a job handler when it could not finish the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Temporary failure. The job is retried with backoff.
    #[error("transient failure: {message}")]
    Transient {
        /// Failure description
        message: String,
    },

    /// Permanent failure such as a malformed payload. Never retried.
    #[error("terminal failure: {message}")]
    Terminal {
        /// Failure description
        message: String,
    },

    /// The handler exceeded its time budget.
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout {
        /// Budget that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// No handler is registered for the job's kind.
    #[error("no handler registered for {kind}")]
    Unhandled {
        /// Job kind that had no handler
        kind: String,
    },
}

impl HandlerError {
    /// Creates a retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Creates a non-retryable failure.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal { message: message.into() }
    }

    /// Creates a timeout failure.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Determines whether the job should be scheduled for another attempt.
    ///
    /// Returns `true` for transient failures and timeouts. Terminal failures
    /// and missing handlers go straight to `failed`.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => true,
            Self::Terminal { .. } | Self::Unhandled { .. } => false,
        }
    }
}

/// Category of a dispatch or handler failure, used as a log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Store connectivity or query failures.
    Store,
    /// Lost races on job state.
    Conflict,
    /// Caller mistakes.
    Input,
    /// Queue closed or workers shutting down.
    Lifecycle,
    /// Handler failures that will be retried.
    Transient,
    /// Handler failures that end the job.
    Terminal,
    /// Configuration and internal problems.
    Internal,
}

impl From<&DispatchError> for ErrorCategory {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::StoreUnavailable { .. } | DispatchError::Store { .. } => Self::Store,
            DispatchError::Conflict { .. } => Self::Conflict,
            DispatchError::InvalidInput { .. } => Self::Input,
            DispatchError::QueueClosed
            | DispatchError::ShutdownTimeout { .. }
            | DispatchError::WorkerPanic { .. } => Self::Lifecycle,
            DispatchError::Configuration { .. } | DispatchError::Internal { .. } => Self::Internal,
        }
    }
}

impl From<&HandlerError> for ErrorCategory {
    fn from(error: &HandlerError) -> Self {
        if error.is_retryable() {
            Self::Transient
        } else {
            Self::Terminal
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => write!(f, "store"),
            Self::Conflict => write!(f, "conflict"),
            Self::Input => write!(f, "input"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
