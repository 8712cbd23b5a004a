//! In-flight request tracking.
//!
//! # Responsibilities
//! - Count requests between arrival and the end of their response body
//! - Let shutdown wait until the count reaches zero
//!
//! # Design Decisions
//! - The count lives in a watch channel so waiters are woken on change
//!   instead of polling
//! - A guard decrements on drop, so cancelled or failed requests are
//!   never leaked

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Tracks in-flight requests for graceful shutdown.
#[derive(Debug, Clone)]
pub struct RequestTracker {
    count: Arc<watch::Sender<usize>>,
}

impl RequestTracker {
    /// Create a new request tracker.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Record a new request. Returns a guard that decrements on drop.
    pub fn track(&self) -> RequestGuard {
        self.count.send_modify(|n| *n += 1);
        RequestGuard {
            count: self.count.clone(),
        }
    }

    /// Get current in-flight request count.
    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no request is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Wait until idle or until `limit` elapses. Returns true when idle.
    pub async fn wait_idle_for(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_idle()).await.is_ok()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a request's lifetime.
/// Decrements the in-flight count when dropped.
#[derive(Debug)]
pub struct RequestGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tracker_counts() {
        let tracker = RequestTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_wakes_on_last_guard() {
        let tracker = RequestTracker::new();
        let guard = tracker.track();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(guard);
        });

        assert!(!tracker.wait_idle_for(Duration::from_secs(1)).await);
        assert!(tracker.wait_idle_for(Duration::from_secs(10)).await);
        assert_eq!(tracker.active_count(), 0);
    }
}
