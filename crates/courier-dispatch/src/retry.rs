//! Exponential backoff retry strategies with jitter.
//!
//! Turns a failed attempt into either a new `next_run_at` for the job or a
//! terminal failure. Classification is the handler's job: the policy only
//! reads [`HandlerError::is_retryable`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Retry policy configuration for job handlers.
///
/// The engine holds one default policy; the attempt ceiling is overridden
/// per job from the job's own `max_attempts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of handler invocations (including the first).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: courier_core::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Same delays, different attempt ceiling.
    #[must_use]
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self { max_attempts, ..self.clone() }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay grows by `base_delay` each attempt.
    Linear,
}

/// Retry decision context for a failed handler invocation.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far, including the one that just failed (1-based).
    pub attempt_number: u32,
    /// Error returned by the handler.
    pub error: HandlerError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the job eligible again at the specified time.
    Retry {
        /// Earliest time of the next attempt
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop. The job becomes `failed`.
    GiveUp {
        /// Why the job will not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        error: HandlerError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// A non-retryable error gives up regardless of how many attempts are
    /// left. Otherwise the job is retried until `max_attempts` is reached.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };
        let next_attempt_at = self.failed_at + chrono_delay;

        RetryDecision::Retry { next_attempt_at }
    }

    /// Calculates the delay until the next attempt.
    pub fn calculate_delay(&self) -> Duration {
        let base_delay = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => self.policy.base_delay * self.attempt_number.max(1),
            BackoffStrategy::Exponential => {
                let exponent = self.attempt_number.saturating_sub(1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                self.policy.base_delay.saturating_mul(multiplier)
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.policy.max_delay);

        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor`.
///
/// With `jitter_factor = 0.25` a 10s delay becomes anything from 7.5s to
/// 12.5s. Zero or negative factors return the delay unchanged.
pub fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
