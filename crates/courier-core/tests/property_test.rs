//! Property-based tests for core domain rules.
//!
//! Lane naming, the job lifecycle and time arithmetic must hold for any
//! input. Everything here is in-memory.

#![allow(clippy::unwrap_used)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use courier_core::{
    models::{cutoff_before, MAX_LANE_LEN},
    Clock, EnqueueOptions, Job, JobPayload, JobState, Lane, TestClock,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 200,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn state_strategy() -> impl Strategy<Value = JobState> {
    prop::sample::select(JobState::ALL.to_vec())
}

fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_000_000_000).prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap())
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn conforming_lane_names_are_accepted(name in "[a-z0-9_-]{1,64}") {
        let lane = Lane::new(name.clone()).unwrap();
        prop_assert_eq!(lane.as_str(), name.as_str());
        prop_assert_eq!(name.parse::<Lane>().unwrap(), lane);
    }

    #[test]
    fn lane_names_with_foreign_characters_are_rejected(
        prefix in "[a-z]{0,10}",
        bad in "[A-Z ./:!]",
        suffix in "[a-z]{0,10}",
    ) {
        let lane_name = format!("{prefix}{bad}{suffix}");
        prop_assert!(Lane::new(lane_name).is_err());
    }

    #[test]
    fn oversized_lane_names_are_rejected(extra in 1usize..32) {
        prop_assert!(Lane::new("a".repeat(MAX_LANE_LEN + extra)).is_err());
    }

    #[test]
    fn terminal_states_have_no_successor(from in state_strategy(), to in state_strategy()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn every_transition_passes_through_active(from in state_strategy(), to in state_strategy()) {
        if from.can_transition_to(to) {
            prop_assert!(from == JobState::Active || to == JobState::Active);
        }
    }

    #[test]
    fn state_names_round_trip(state in state_strategy()) {
        prop_assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
    }

    #[test]
    fn new_jobs_are_scheduled_after_their_delay(
        delay_secs in 0u64..86_400,
        max_attempts in 1u32..20,
        now in timestamp_strategy(),
    ) {
        let options = EnqueueOptions::default()
            .with_delay(Duration::from_secs(delay_secs))
            .with_max_attempts(max_attempts);
        let job = Job::new(Lane::files(), JobPayload::send_message("+15550000000", "hi"), options, now)
            .unwrap();

        prop_assert_eq!(job.attempts, 0);
        prop_assert_eq!(job.attempts_remaining(), max_attempts);
        prop_assert_eq!(job.next_run_at - now, chrono::Duration::seconds(delay_secs as i64));
        prop_assert_eq!(job.state == JobState::Waiting, delay_secs == 0);
        prop_assert_eq!(job.is_due(now), delay_secs == 0);
        prop_assert!(job.is_due(job.next_run_at));
    }

    #[test]
    fn cutoff_never_moves_forward(now in timestamp_strategy(), age_secs in 0u64..u64::MAX / 2) {
        let cutoff = cutoff_before(now, Duration::from_secs(age_secs));
        prop_assert!(cutoff <= now);
    }

    #[test]
    fn test_clock_advances_by_the_sum_of_steps(steps in prop::collection::vec(0u64..10_000, 0..20)) {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);
        let instant = clock.now();

        for step in &steps {
            clock.advance(Duration::from_millis(*step));
        }

        let total = Duration::from_millis(steps.iter().sum());
        prop_assert_eq!(clock.now() - instant, total);
        prop_assert_eq!(clock.now_system(), start + total);
        prop_assert!(clock.now_system() >= SystemTime::UNIX_EPOCH);
    }
}
