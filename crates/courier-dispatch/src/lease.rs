//! Rolling per-minute cap on leases for one lane.
//!
//! The cap refuses instead of blocking: once a lane has granted its quota
//! within the last minute, `lease_next` reports "nothing to do" and the
//! worker goes back to its idle poll.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, Job, Lane, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::JobStore;

const WINDOW: Duration = Duration::from_secs(60);

/// Lease counter shared by every worker of one lane.
#[derive(Debug)]
pub struct LeaseWindow {
    cap: Option<u32>,
    granted: Mutex<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
}

impl LeaseWindow {
    /// Creates a window allowing `cap` leases per rolling minute.
    ///
    /// `None` disables the cap.
    pub fn new(cap: Option<u32>, clock: Arc<dyn Clock>) -> Self {
        Self { cap, granted: Mutex::new(VecDeque::new()), clock }
    }

    /// Configured leases-per-minute cap.
    pub fn cap(&self) -> Option<u32> {
        self.cap
    }

    /// Leases the next due job unless the lane is over its cap.
    ///
    /// A reservation is taken before asking the store and handed back when
    /// the store has nothing due or fails.
    ///
    /// # Errors
    ///
    /// Propagates store errors from `lease_next`.
    pub async fn lease_next(&self, store: &dyn JobStore, lane: &Lane) -> Result<Option<Job>> {
        let Some(reserved_at) = self.try_reserve().await else {
            debug!(lane = %lane, cap = ?self.cap, "lease cap reached for this minute");
            return Ok(None);
        };

        match store.lease_next(lane.clone()).await {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => {
                self.refund(reserved_at).await;
                Ok(None)
            },
            Err(error) => {
                self.refund(reserved_at).await;
                Err(error)
            },
        }
    }

    /// Leases counted against the current minute.
    pub async fn in_window(&self) -> usize {
        let mut granted = self.granted.lock().await;
        Self::evict(&mut granted, self.clock.now());
        granted.len()
    }

    async fn try_reserve(&self) -> Option<Instant> {
        let now = self.clock.now();
        let Some(cap) = self.cap else {
            return Some(now);
        };

        let mut granted = self.granted.lock().await;
        Self::evict(&mut granted, now);

        if granted.len() >= usize::try_from(cap).unwrap_or(usize::MAX) {
            return None;
        }

        granted.push_back(now);
        Some(now)
    }

    async fn refund(&self, reserved_at: Instant) {
        if self.cap.is_none() {
            return;
        }

        let mut granted = self.granted.lock().await;
        if let Some(position) = granted.iter().rposition(|at| *at == reserved_at) {
            granted.remove(position);
        }
    }

    fn evict(granted: &mut VecDeque<Instant>, now: Instant) {
        while granted.front().is_some_and(|at| now.saturating_duration_since(*at) >= WINDOW) {
            granted.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EnqueueOptions, JobPayload, TestClock};

    use super::*;
    use crate::storage::memory::InMemoryJobStore;

    async fn store_with_jobs(clock: &TestClock, count: usize) -> InMemoryJobStore {
        let store = InMemoryJobStore::new(Arc::new(clock.clone()));
        for i in 0..count {
            store
                .enqueue(
                    Lane::files(),
                    JobPayload::send_message("+15550100", format!("job {i}")),
                    EnqueueOptions::default(),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn cap_refuses_once_quota_is_used() {
        let clock = TestClock::new();
        let store = store_with_jobs(&clock, 5).await;
        let window = LeaseWindow::new(Some(3), Arc::new(clock.clone()));

        for _ in 0..3 {
            assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_some());
        }

        assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_none());
        assert_eq!(window.in_window().await, 3);
    }

    #[tokio::test]
    async fn quota_recovers_after_a_minute() {
        let clock = TestClock::new();
        let store = store_with_jobs(&clock, 3).await;
        let window = LeaseWindow::new(Some(2), Arc::new(clock.clone()));

        window.lease_next(&store, &Lane::files()).await.unwrap();
        window.lease_next(&store, &Lane::files()).await.unwrap();
        assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_none());

        clock.advance(Duration::from_secs(60));

        assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_polls_do_not_consume_quota() {
        let clock = TestClock::new();
        let store = store_with_jobs(&clock, 0).await;
        let window = LeaseWindow::new(Some(1), Arc::new(clock.clone()));

        for _ in 0..10 {
            assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_none());
        }

        assert_eq!(window.in_window().await, 0);
    }

    #[tokio::test]
    async fn store_failures_refund_the_reservation() {
        let clock = TestClock::new();
        let store = store_with_jobs(&clock, 1).await;
        let window = LeaseWindow::new(Some(1), Arc::new(clock.clone()));

        store.inject_store_error("connection reset").await;
        assert!(window.lease_next(&store, &Lane::files()).await.is_err());

        assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn uncapped_window_never_refuses() {
        let clock = TestClock::new();
        let store = store_with_jobs(&clock, 150).await;
        let window = LeaseWindow::new(None, Arc::new(clock.clone()));

        for _ in 0..150 {
            assert!(window.lease_next(&store, &Lane::files()).await.unwrap().is_some());
        }
        assert_eq!(window.in_window().await, 0);
    }
}
