//! Test infrastructure and utilities for deterministic testing.
//!
//! Provides fixture builders, scripted job handlers, an in-memory dispatch
//! harness driven by a [`TestClock`], invariant checks and proptest
//! strategies. Nothing here touches a database or the real clock.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod handlers;
pub mod harness;
pub mod invariants;
pub mod property;

pub use courier_core::{Clock, TestClock};
pub use fixtures::{file_import, message, JobBuilder};
pub use handlers::{GateHandler, Invocation, ScriptedHandler};
pub use harness::{TestHarness, TestHarnessBuilder};
pub use invariants::Invariants;

/// Gaps between consecutive instants.
pub fn gaps(instants: &[std::time::Instant]) -> Vec<std::time::Duration> {
    instants.windows(2).map(|pair| pair[1].saturating_duration_since(pair[0])).collect()
}
