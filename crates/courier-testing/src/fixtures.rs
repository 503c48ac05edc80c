//! Test data builders for jobs and payloads.
//!
//! Builders carry sensible defaults so a test only spells out the fields it
//! cares about.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{EnqueueOptions, FileOperation, Job, JobPayload, JobState, Lane};

/// Message payload to a fixed test recipient.
pub fn message(content: impl Into<String>) -> JobPayload {
    JobPayload::send_message(TEST_RECIPIENT, content)
}

/// File import payload.
pub fn file_import(file_ref: impl Into<String>) -> JobPayload {
    JobPayload::process_file(file_ref, FileOperation::Import)
}

/// Recipient used by [`message`].
pub const TEST_RECIPIENT: &str = "+15550100";

/// Builder for [`Job`] records.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    lane: Lane,
    payload: JobPayload,
    options: EnqueueOptions,
    state: Option<JobState>,
    attempts: u32,
    created_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl JobBuilder {
    /// A waiting `send_message` job on the `bulk-sms` lane.
    pub fn message(content: impl Into<String>) -> Self {
        Self::new(Lane::bulk_sms(), message(content))
    }

    /// A waiting `process_file` job on the `files` lane.
    pub fn file(file_ref: impl Into<String>) -> Self {
        Self::new(Lane::files(), file_import(file_ref))
    }

    /// Job with the given lane and payload and default options.
    pub fn new(lane: Lane, payload: JobPayload) -> Self {
        Self {
            lane,
            payload,
            options: EnqueueOptions::default(),
            state: None,
            attempts: 0,
            created_at: None,
            last_error: None,
        }
    }

    /// Sets the lane.
    #[must_use]
    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.options = self.options.with_delay(delay);
        self
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.options = self.options.with_max_attempts(max_attempts);
        self
    }

    /// Forces the state instead of deriving it from the delay.
    #[must_use]
    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the number of invocations already made.
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Records a previous failure.
    #[must_use]
    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Enqueue options for producers and the facade.
    pub fn options(&self) -> EnqueueOptions {
        self.options
    }

    /// Lane and payload for `enqueue` calls.
    pub fn parts(self) -> (Lane, JobPayload, EnqueueOptions) {
        (self.lane, self.payload, self.options)
    }

    /// Builds the record as of `now`.
    ///
    /// # Panics
    ///
    /// Panics if the options are invalid, such as a zero attempt ceiling.
    pub fn build(self, now: DateTime<Utc>) -> Job {
        let created_at = self.created_at.unwrap_or(now);
        let mut job = Job::new(self.lane, self.payload, self.options, created_at)
            .expect("job builder produced invalid options");

        job.attempts = i32::try_from(self.attempts).expect("attempts fit in i32");
        job.last_error = self.last_error;
        if let Some(state) = self.state {
            job.state = state;
            match state {
                JobState::Active => job.leased_at = Some(now),
                JobState::Completed => job.completed_at = Some(now),
                JobState::Failed => job.failed_at = Some(now),
                JobState::Waiting | JobState::Delayed => {},
            }
        }

        job
    }
}
