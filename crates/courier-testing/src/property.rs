//! Proptest strategies for jobs and store operation sequences.
//!
//! Stateful property tests draw a random sequence of [`StoreAction`]s, apply
//! them to a store and check the invariants after every step.

use std::time::Duration;

use courier_core::{EnqueueOptions, FileOperation, JobPayload, Lane};
use proptest::prelude::{any, prop, prop_oneof, Just, Strategy};

/// Lanes used by generated actions.
pub fn lane_strategy() -> impl Strategy<Value = Lane> {
    prop_oneof![Just(Lane::bulk_sms()), Just(Lane::files())]
}

/// Valid payloads of either kind.
pub fn payload_strategy() -> impl Strategy<Value = JobPayload> {
    let message = ("\\+1555[0-9]{7}", "[a-zA-Z0-9 ]{1,40}")
        .prop_map(|(recipient, content)| JobPayload::send_message(recipient, content));
    let file = (
        "[a-z]{1,12}/[a-z0-9_]{1,16}\\.csv",
        prop_oneof![
            Just(FileOperation::Import),
            Just(FileOperation::Export),
            Just(FileOperation::Delete)
        ],
    )
        .prop_map(|(file_ref, operation)| JobPayload::process_file(file_ref, operation));

    prop_oneof![message, file]
}

/// Enqueue options with small delays and ceilings.
pub fn options_strategy() -> impl Strategy<Value = EnqueueOptions> {
    (prop_oneof![Just(0u64), 1u64..120], 1u32..=5).prop_map(|(delay_secs, max_attempts)| {
        EnqueueOptions::default()
            .with_delay(Duration::from_secs(delay_secs))
            .with_max_attempts(max_attempts)
    })
}

/// One step against a job store.
#[derive(Debug, Clone)]
pub enum StoreAction {
    /// Enqueue a new job.
    Enqueue {
        /// Target lane
        lane: Lane,
        /// Job payload
        payload: JobPayload,
        /// Delay and ceiling
        options: EnqueueOptions,
    },
    /// Lease the next due job in a lane and resolve it.
    LeaseAndResolve {
        /// Lane to lease from
        lane: Lane,
        /// How the handler result is recorded
        resolution: Resolution,
    },
    /// Move time forward.
    AdvanceTime {
        /// How far
        duration: Duration,
    },
    /// Cancel the nth job ever enqueued, if it exists.
    Cancel {
        /// Index into the enqueued ids
        index: usize,
    },
    /// Requeue leases older than the given age.
    RequeueStale {
        /// Lane to sweep
        lane: Lane,
    },
}

/// How a leased job is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// `mark_completed`
    Complete,
    /// `mark_failed_retryable` a few seconds out
    Retry,
    /// `mark_failed_terminal`
    Fail,
    /// `release_lease`
    Release,
    /// Leave the job active
    Abandon,
}

/// Random store actions, weighted towards enqueue and lease.
pub fn action_strategy() -> impl Strategy<Value = StoreAction> {
    let resolution = prop_oneof![
        4 => Just(Resolution::Complete),
        3 => Just(Resolution::Retry),
        1 => Just(Resolution::Fail),
        1 => Just(Resolution::Release),
        1 => Just(Resolution::Abandon),
    ];

    prop_oneof![
        4 => (lane_strategy(), payload_strategy(), options_strategy())
            .prop_map(|(lane, payload, options)| StoreAction::Enqueue { lane, payload, options }),
        4 => (lane_strategy(), resolution)
            .prop_map(|(lane, resolution)| StoreAction::LeaseAndResolve { lane, resolution }),
        2 => (1u64..600).prop_map(|secs| StoreAction::AdvanceTime { duration: Duration::from_secs(secs) }),
        1 => any::<prop::sample::Index>().prop_map(|index| StoreAction::Cancel { index: index.index(64) }),
        1 => lane_strategy().prop_map(|lane| StoreAction::RequeueStale { lane }),
    ]
}

/// Sequences of up to `max_len` actions.
pub fn action_sequence(max_len: usize) -> impl Strategy<Value = Vec<StoreAction>> {
    prop::collection::vec(action_strategy(), 1..max_len)
}
