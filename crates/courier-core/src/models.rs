//! Job records, lanes and queue projections.
//!
//! Defines the persisted job record, its lifecycle states and the tagged
//! payload union, along with the strongly-typed identifiers and read models
//! consumed by dashboards. Database encoding lives next to each type so the
//! repository layer stays free of string juggling.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Attempts granted to a job when the producer does not ask for a number.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Longest delay a producer may ask for at enqueue time.
pub const MAX_ENQUEUE_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Longest accepted lane name.
pub const MAX_LANE_LEN: usize = 64;

/// Strongly-typed job identifier.
///
/// Assigned once at enqueue time and never reused.
///
/// # Example
///
/// ```
/// use courier_core::models::JobId;
/// let job_id = JobId::new();
/// println!("leased job {job_id}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidInput(format!("invalid job id '{s}': {e}")))
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Named, independently scheduled sub-queue.
///
/// Lane names are lowercase ASCII letters, digits, `-` and `_`, at most
/// [`MAX_LANE_LEN`] characters. Jobs in different lanes never block each
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lane(String);

impl Lane {
    /// Lane for throttled outbound SMS sends.
    pub const BULK_SMS: &'static str = "bulk-sms";

    /// Lane for file import/export work.
    pub const FILES: &'static str = "files";

    /// Validates and wraps a lane name.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for empty, oversized or
    /// non-conforming names.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(CoreError::InvalidInput("lane name must not be empty".to_string()));
        }

        if name.len() > MAX_LANE_LEN {
            return Err(CoreError::InvalidInput(format!(
                "lane name exceeds {MAX_LANE_LEN} characters"
            )));
        }

        if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidInput(format!(
                "lane name '{name}' may only contain [a-z0-9_-]"
            )));
        }

        Ok(Self(name))
    }

    /// The `bulk-sms` lane.
    pub fn bulk_sms() -> Self {
        Self(Self::BULK_SMS.to_string())
    }

    /// The `files` lane.
    pub fn files() -> Self {
        Self(Self::FILES.to_string())
    }

    /// Lane name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Lane {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Lane {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Lane> for String {
    fn from(lane: Lane) -> Self {
        lane.0
    }
}

impl sqlx::Type<PgDb> for Lane {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Lane {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self::new(s)?)
    }
}

impl sqlx::Encode<'_, PgDb> for Lane {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Job lifecycle state.
///
/// ```text
/// Waiting ─┐
///          ├─> Active ─> Completed
/// Delayed ─┘     │
///    ^           ├─> Delayed   (retryable failure, attempts left)
///    └───────────┘
///                └─> Failed    (terminal error or attempts exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued and eligible as soon as a worker polls.
    Waiting,

    /// Leased by exactly one worker.
    Active,

    /// Handler succeeded. Terminal.
    Completed,

    /// Terminal failure, kept for inspection and never re-processed.
    Failed,

    /// Waiting for `next_run_at`, either from an initial delay or a retry.
    Delayed,
}

impl JobState {
    /// Every state, in dashboard order.
    pub const ALL: [Self; 5] =
        [Self::Waiting, Self::Active, Self::Completed, Self::Failed, Self::Delayed];

    /// Whether the job will never run again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a worker may lease a job in this state once it is due.
    pub const fn is_leasable(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    /// Whether a producer may still remove the job.
    pub const fn is_cancellable(self) -> bool {
        self.is_leasable()
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// `Active -> Delayed` covers both retry scheduling and returning a lease
    /// that never reached its handler.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting | Self::Delayed, Self::Active)
                | (Self::Active, Self::Completed | Self::Failed | Self::Delayed)
        )
    }

    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            _ => Err(CoreError::InvalidInput(format!("invalid job state: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for JobState {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobState {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

/// Operation applied to a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    /// Pull records out of the file into the application.
    Import,
    /// Produce the file from application data.
    Export,
    /// Remove the stored file.
    Delete,
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => write!(f, "import"),
            Self::Export => write!(f, "export"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Handler selector derived from a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Outbound message through the messaging provider.
    SendMessage,
    /// File processing task.
    ProcessFile,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendMessage => write!(f, "send_message"),
            Self::ProcessFile => write!(f, "process_file"),
        }
    }
}

/// Operation-specific job data, stored as JSONB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Send `content` to `recipient`.
    SendMessage {
        /// Destination address understood by the message sender.
        recipient: String,
        /// Message body.
        content: String,
    },

    /// Apply `operation` to the file referenced by `file_ref`.
    ProcessFile {
        /// Storage reference of the file.
        file_ref: String,
        /// Operation to perform.
        operation: FileOperation,
    },
}

impl JobPayload {
    /// Convenience constructor for message payloads.
    pub fn send_message(recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self::SendMessage { recipient: recipient.into(), content: content.into() }
    }

    /// Convenience constructor for file payloads.
    pub fn process_file(file_ref: impl Into<String>, operation: FileOperation) -> Self {
        Self::ProcessFile { file_ref: file_ref.into(), operation }
    }

    /// Handler selector for this payload.
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::SendMessage { .. } => JobKind::SendMessage,
            Self::ProcessFile { .. } => JobKind::ProcessFile,
        }
    }

    /// Rejects payloads no handler could act on.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when a required field is blank.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SendMessage { recipient, .. } if recipient.trim().is_empty() => {
                Err(CoreError::InvalidInput("recipient must not be empty".to_string()))
            },
            Self::SendMessage { content, .. } if content.is_empty() => {
                Err(CoreError::InvalidInput("message content must not be empty".to_string()))
            },
            Self::ProcessFile { file_ref, .. } if file_ref.trim().is_empty() => {
                Err(CoreError::InvalidInput("file_ref must not be empty".to_string()))
            },
            _ => Ok(()),
        }
    }
}

/// Producer-supplied enqueue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the job becomes eligible. Zero means immediately.
    pub delay: Duration,
    /// Ceiling on handler invocations. `None` takes the queue's default.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    /// Sets the initial delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { delay: Duration::ZERO, max_attempts: None }
    }
}

/// Persisted job record.
///
/// `attempts` counts handler invocations and never exceeds `max_attempts`.
/// At most one worker holds a job while it is `Active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,

    /// Lane the job is scheduled in.
    pub lane: Lane,

    /// Operation-specific data.
    pub payload: Json<JobPayload>,

    /// Current lifecycle state.
    pub state: JobState,

    /// Handler invocations so far.
    pub attempts: i32,

    /// Invocation ceiling.
    pub max_attempts: i32,

    /// Earliest time the job may be leased.
    pub next_run_at: DateTime<Utc>,

    /// Enqueue time.
    pub created_at: DateTime<Utc>,

    /// When the current or most recent lease was granted.
    pub leased_at: Option<DateTime<Utc>>,

    /// When the handler succeeded.
    pub completed_at: Option<DateTime<Utc>>,

    /// When the job failed terminally.
    pub failed_at: Option<DateTime<Utc>>,

    /// Most recent failure reason.
    pub last_error: Option<String>,
}

impl Job {
    /// Builds a fresh record for `enqueue`.
    ///
    /// A positive delay starts the job in `Delayed`, otherwise `Waiting`.
    /// Without an explicit attempt ceiling the job gets [`DEFAULT_MAX_ATTEMPTS`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when `max_attempts` is zero, does not
    /// fit the database column, or the delay is out of range.
    pub fn new(
        lane: Lane,
        payload: JobPayload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let max_attempts = options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(CoreError::InvalidInput("max_attempts must be at least 1".to_string()));
        }

        let max_attempts = i32::try_from(max_attempts)
            .map_err(|_| CoreError::InvalidInput("max_attempts is too large".to_string()))?;

        if options.delay > MAX_ENQUEUE_DELAY {
            return Err(CoreError::InvalidInput("enqueue delay is out of range".to_string()));
        }

        let next_run_at = chrono::Duration::from_std(options.delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| CoreError::InvalidInput("enqueue delay is out of range".to_string()))?;

        let state = if options.delay.is_zero() { JobState::Waiting } else { JobState::Delayed };

        Ok(Self {
            id: JobId::new(),
            lane,
            payload: Json(payload),
            state,
            attempts: 0,
            max_attempts,
            next_run_at,
            created_at: now,
            leased_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
        })
    }

    /// The job's payload.
    pub fn payload(&self) -> &JobPayload {
        &self.payload.0
    }

    /// Handler selector.
    pub fn kind(&self) -> JobKind {
        self.payload.0.kind()
    }

    /// Whether a worker could lease the job at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_leasable() && self.next_run_at <= now
    }

    /// Handler invocations still allowed.
    pub fn attempts_remaining(&self) -> u32 {
        u32::try_from(self.max_attempts.saturating_sub(self.attempts)).unwrap_or(0)
    }

    /// The lease this record was read under.
    pub fn lease(&self) -> Lease {
        Lease { job_id: self.id, leased_at: self.leased_at, attempt: self.attempts }
    }
}

/// Identifies one lease of a job for its outcome write.
///
/// Stale-lease recovery may hand a job to another worker while the first
/// handler is still running. The store only accepts an outcome whose lease
/// stamp and attempt number match the job's current lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Leased job.
    pub job_id: JobId,
    /// When the lease was granted.
    pub leased_at: Option<DateTime<Utc>>,
    /// Attempt number the lease started.
    pub attempt: i32,
}

impl Lease {
    /// Whether `job` is still active under this lease.
    pub fn holds(&self, job: &Job) -> bool {
        job.id == self.job_id
            && job.state == JobState::Active
            && job.leased_at.is_some()
            && job.leased_at == self.leased_at
            && job.attempts == self.attempt
    }
}

/// Dashboard projection of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobSummary {
    /// Job identifier.
    pub id: JobId,
    /// Lane name.
    pub lane: Lane,
    /// Current state.
    pub state: JobState,
    /// Handler invocations so far.
    pub attempts: i32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Most recent failure reason.
    pub last_error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            lane: job.lane.clone(),
            state: job.state,
            attempts: job.attempts,
            created_at: job.created_at,
            last_error: job.last_error.clone(),
        }
    }
}

/// Per-state job counts for one lane, derived on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs eligible once a worker polls.
    pub waiting: u64,
    /// Jobs currently leased.
    pub active: u64,
    /// Jobs that succeeded and have not been pruned.
    pub completed: u64,
    /// Jobs that failed terminally.
    pub failed: u64,
    /// Jobs waiting for their `next_run_at`.
    pub delayed: u64,
}

impl QueueStats {
    /// Adds `count` jobs to the bucket for `state`.
    pub fn record(&mut self, state: JobState, count: u64) {
        let bucket = match state {
            JobState::Waiting => &mut self.waiting,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Delayed => &mut self.delayed,
        };
        *bucket += count;
    }

    /// Count for a single state.
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Delayed => self.delayed,
        }
    }

    /// Jobs in any state.
    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|state| self.count(*state)).sum()
    }
}

/// Retention thresholds for terminal jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunePolicy {
    /// Completed jobs older than this are removed.
    pub completed_max_age: Duration,
    /// Only the newest this-many completed jobs are kept.
    pub completed_retain: usize,
    /// Failed jobs older than this are removed. `None` keeps them forever.
    pub failed_max_age: Option<Duration>,
}

impl PrunePolicy {
    /// Same thresholds for completed jobs, failed jobs left untouched.
    #[must_use]
    pub fn completed_only(self) -> Self {
        Self { failed_max_age: None, ..self }
    }
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            completed_max_age: Duration::from_secs(60 * 60),
            completed_retain: 100,
            failed_max_age: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Result of a prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneOutcome {
    /// Jobs deleted.
    pub removed: u64,
}

/// Subtracts a std duration from a timestamp, clamping on overflow.
pub fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
