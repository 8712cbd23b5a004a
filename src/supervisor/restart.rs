//! Restart policy: exponential backoff with jitter and bounded retries.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::schema::RestartConfig;

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub health_window: Duration,
    pub max_consecutive_failures: u32,
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            health_window: Duration::from_secs(config.health_window_secs),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    /// Delay before restart number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` plus up to 10% jitter, then capped. Jitter goes
    /// on before the cap, so below the cap each delay is strictly larger
    /// than the previous one.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt - 1);
        let delay_ms = base_ms.saturating_mul(exponential);

        let jitter_range = delay_ms / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(delay_ms.saturating_add(jitter)).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart(Duration),
    GiveUp,
}

/// Crash bookkeeping for one replica slot.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    consecutive_failures: u32,
    restarts: u64,
    ready_since: Option<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            restarts: 0,
            ready_since: None,
        }
    }

    pub fn mark_ready(&mut self, now: Instant) {
        self.ready_since = Some(now);
    }

    /// Failures counted as of `now`, after any health-window reset.
    pub fn consecutive_failures(&self, now: Instant) -> u32 {
        match self.ready_since {
            Some(since) if now.duration_since(since) >= self.policy.health_window => 0,
            _ => self.consecutive_failures,
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Record a crash (or failed start) and decide what happens next.
    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        self.consecutive_failures = self.consecutive_failures(now) + 1;
        self.ready_since = None;

        if self.consecutive_failures > self.policy.max_consecutive_failures {
            return RestartDecision::GiveUp;
        }
        self.restarts += 1;
        RestartDecision::Restart(self.policy.backoff(self.consecutive_failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_failures: u32) -> RestartPolicy {
        RestartPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
            health_window: Duration::from_secs(60),
            max_consecutive_failures: max_failures,
        }
    }

    #[test]
    fn test_backoff_bounds() {
        let p = policy(5);
        for attempt in 1..=4u32 {
            let base = 100u128 * 2u128.pow(attempt - 1);
            let d = p.backoff(attempt).as_millis();
            assert!(d >= base && d <= base + base / 10, "attempt {}: {}", attempt, d);
        }
        assert_eq!(p.backoff(10), Duration::from_millis(2_000));
        assert_eq!(p.backoff(64), Duration::from_millis(2_000));
    }

    #[test]
    fn test_backoff_monotonic() {
        let p = policy(5);
        for _ in 0..50 {
            let delays: Vec<Duration> = (1..=8).map(|a| p.backoff(a)).collect();
            for pair in delays.windows(2) {
                assert!(pair[1] >= pair[0]);
                if pair[1] < p.max_delay {
                    assert!(pair[1] > pair[0]);
                }
            }
        }
    }

    #[test]
    fn test_gives_up_after_max_failures() {
        // Three crashes inside the health window restart with growing
        // delays; the fourth gives up.
        let mut tracker = RestartTracker::new(policy(3));
        let now = Instant::now();

        let mut last = Duration::ZERO;
        for i in 0..3 {
            tracker.mark_ready(now);
            match tracker.record_crash(now + Duration::from_secs(i)) {
                RestartDecision::Restart(d) => {
                    assert!(d > last);
                    last = d;
                }
                RestartDecision::GiveUp => panic!("gave up too early"),
            }
        }
        assert_eq!(tracker.record_crash(now + Duration::from_secs(4)), RestartDecision::GiveUp);
        assert_eq!(tracker.restarts(), 3);
    }

    #[test]
    fn test_health_window_resets_counter() {
        let mut tracker = RestartTracker::new(policy(2));
        let start = Instant::now();

        tracker.record_crash(start);
        tracker.record_crash(start);
        tracker.mark_ready(start);
        assert_eq!(tracker.consecutive_failures(start + Duration::from_secs(30)), 2);

        // Ready for a full window: the next crash counts as the first.
        let later = start + Duration::from_secs(61);
        assert_eq!(tracker.consecutive_failures(later), 0);
        match tracker.record_crash(later) {
            RestartDecision::Restart(d) => assert!(d < Duration::from_millis(200)),
            RestartDecision::GiveUp => panic!("counter was not reset"),
        }
    }

    #[test]
    fn test_crash_before_window_keeps_counting() {
        let mut tracker = RestartTracker::new(policy(1));
        let start = Instant::now();
        tracker.record_crash(start);
        tracker.mark_ready(start);
        assert_eq!(
            tracker.record_crash(start + Duration::from_secs(59)),
            RestartDecision::GiveUp
        );
    }
}
