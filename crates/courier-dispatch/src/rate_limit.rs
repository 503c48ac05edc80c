//! Per-lane permit spacing for outbound sends.
//!
//! A throttled lane hands out at most one permit per interval, no matter how
//! many workers ask at once. Waiters queue on the lane's async mutex and the
//! holder sleeps through the remaining interval while holding it, so the
//! spacing between consecutive grants never drops below the interval. There
//! is no burst credit: an idle lane grants immediately, then spacing resumes.
//!
//! Lane state lives in process memory only. A restart forgets the last grant
//! and the first permit after boot is immediate.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, Lane};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct LaneState {
    next_permit_at: Option<Instant>,
}

/// Gate allowing one permit per fixed interval per lane.
#[derive(Debug)]
pub struct RateLimiter {
    intervals: HashMap<Lane, Duration>,
    lanes: RwLock<HashMap<Lane, Arc<Mutex<LaneState>>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter with no throttled lanes.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { intervals: HashMap::new(), lanes: RwLock::new(HashMap::new()), clock }
    }

    /// Throttles `lane` to one permit per `interval`.
    ///
    /// A zero interval leaves the lane unthrottled.
    #[must_use]
    pub fn with_interval(mut self, lane: Lane, interval: Duration) -> Self {
        if interval.is_zero() {
            self.intervals.remove(&lane);
        } else {
            self.intervals.insert(lane, interval);
        }
        self
    }

    /// Configured interval for `lane`, if it is throttled.
    pub fn interval(&self, lane: &Lane) -> Option<Duration> {
        self.intervals.get(lane).copied()
    }

    /// Whether `acquire` may wait for this lane.
    pub fn is_throttled(&self, lane: &Lane) -> bool {
        self.intervals.contains_key(lane)
    }

    /// Waits for the lane's next permit and returns the grant instant.
    ///
    /// Unthrottled lanes return immediately. Dropping the future while it
    /// waits leaves the lane exactly as it was.
    pub async fn acquire(&self, lane: &Lane) -> Instant {
        let Some(interval) = self.interval(lane) else {
            return self.clock.now();
        };

        let state = self.lane_state(lane).await;
        let mut guard = state.lock().await;

        let now = self.clock.now();
        if let Some(next) = guard.next_permit_at {
            let wait = next.saturating_duration_since(now);
            if !wait.is_zero() {
                debug!(lane = %lane, wait_ms = wait.as_millis(), "waiting for rate permit");
                self.clock.sleep(wait).await;
            }
        }

        let granted = self.clock.now();
        guard.next_permit_at = Some(granted + interval);
        drop(guard);

        debug!(lane = %lane, "rate permit granted");
        granted
    }

    /// Earliest instant the next permit for `lane` can be granted.
    ///
    /// `None` for unthrottled lanes and lanes that never granted a permit.
    pub async fn next_permit_at(&self, lane: &Lane) -> Option<Instant> {
        let state = self.lanes.read().await.get(lane).cloned()?;
        let guard = state.lock().await;
        guard.next_permit_at
    }

    async fn lane_state(&self, lane: &Lane) -> Arc<Mutex<LaneState>> {
        if let Some(state) = self.lanes.read().await.get(lane) {
            return state.clone();
        }

        self.lanes.write().await.entry(lane.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;
    use futures::FutureExt;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(20);

    fn limiter(clock: &TestClock) -> RateLimiter {
        RateLimiter::new(Arc::new(clock.clone())).with_interval(Lane::bulk_sms(), INTERVAL)
    }

    #[tokio::test]
    async fn first_permit_is_immediate() {
        let clock = TestClock::new();
        let limiter = limiter(&clock);
        let start = clock.now();

        let granted = limiter.acquire(&Lane::bulk_sms()).await;

        assert_eq!(granted, start);
        assert_eq!(limiter.next_permit_at(&Lane::bulk_sms()).await, Some(start + INTERVAL));
    }

    #[tokio::test]
    async fn consecutive_permits_are_spaced_by_interval() {
        let clock = TestClock::new();
        let limiter = limiter(&clock);

        let first = limiter.acquire(&Lane::bulk_sms()).await;
        let second = limiter.acquire(&Lane::bulk_sms()).await;
        let third = limiter.acquire(&Lane::bulk_sms()).await;

        assert_eq!(second.duration_since(first), INTERVAL);
        assert_eq!(third.duration_since(second), INTERVAL);
    }

    #[tokio::test]
    async fn idle_lane_does_not_bank_permits() {
        let clock = TestClock::new();
        let limiter = limiter(&clock);

        limiter.acquire(&Lane::bulk_sms()).await;
        clock.advance(Duration::from_secs(120));

        let after_idle = limiter.acquire(&Lane::bulk_sms()).await;
        let next = limiter.acquire(&Lane::bulk_sms()).await;

        assert_eq!(next.duration_since(after_idle), INTERVAL);
    }

    #[tokio::test]
    async fn concurrent_callers_never_share_an_interval() {
        let clock = TestClock::new();
        let limiter = Arc::new(limiter(&clock));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire(&Lane::bulk_sms()).await })
            })
            .collect();

        let mut grants: Vec<Instant> =
            futures::future::join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();
        grants.sort();

        for pair in grants.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= INTERVAL);
        }
    }

    #[tokio::test]
    async fn unthrottled_lanes_pass_through() {
        let clock = TestClock::new();
        let limiter = limiter(&clock);
        let start = clock.now();

        for _ in 0..5 {
            assert_eq!(limiter.acquire(&Lane::files()).await, start);
        }
        assert!(!limiter.is_throttled(&Lane::files()));
        assert_eq!(limiter.next_permit_at(&Lane::files()).await, None);
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_lane_untouched() {
        let clock = TestClock::new();
        let limiter = limiter(&clock);
        let first = limiter.acquire(&Lane::bulk_sms()).await;

        let pending = limiter.acquire(&Lane::bulk_sms()).now_or_never();

        assert!(pending.is_none(), "second permit must wait");
        assert_eq!(limiter.next_permit_at(&Lane::bulk_sms()).await, Some(first + INTERVAL));
    }

    #[test]
    fn zero_interval_disables_throttling() {
        let limiter = RateLimiter::new(Arc::new(TestClock::new()))
            .with_interval(Lane::files(), Duration::ZERO);

        assert!(!limiter.is_throttled(&Lane::files()));
    }
}
