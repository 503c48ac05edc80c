//! Clock abstraction shared by the store, the rate limiter and the workers.
//!
//! Every component that waits or stamps a time goes through [`Clock`], so
//! tests can drive throttling intervals and retry backoff with a
//! [`TestClock`] instead of sleeping for real.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of time for dispatch components.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant used for permit spacing and elapsed measurements.
    fn now(&self) -> Instant;

    /// Wall-clock time used for persisted timestamps.
    fn now_system(&self) -> SystemTime;

    /// Suspends the caller for `duration`.
    ///
    /// Dropping the returned future must leave no side effects behind other
    /// than time that has already passed.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the OS and tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time. `sleep` advances the shared time by
/// the requested duration and yields once, so a throttled worker observes its
/// full wait without the test taking that long.
#[derive(Debug, Clone)]
pub struct TestClock {
    monotonic_ns: Arc<AtomicU64>,
    system_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock whose wall-clock time starts at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))),
            base_instant: Instant::now(),
        }
    }

    /// Moves both the monotonic and the wall clock forward.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_nanos(duration);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.system_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Sets the wall clock to `time`.
    ///
    /// Moving forward also advances the monotonic clock; moving backwards only
    /// rewinds wall-clock time.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns = saturating_nanos(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current_ns = self.system_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            self.system_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Total monotonic time advanced since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = TestClock::with_start_time(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(20));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(20));
        assert_eq!(clock.now_system(), start + Duration::from_secs(20));
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();

        other.advance(Duration::from_millis(1500));

        assert_eq!(clock.elapsed(), Duration::from_millis(1500));
    }

    #[test]
    fn jump_backwards_keeps_monotonic_time() {
        let start = UNIX_EPOCH + Duration::from_secs(5_000);
        let clock = TestClock::with_start_time(start);
        clock.advance(Duration::from_secs(10));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(100));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn now_utc_tracks_system_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_utc().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(20)).await;

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(20));
    }
}
