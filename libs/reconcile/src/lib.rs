//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered
//! reconcilers that converge a scale target toward a computed replica count.
//! Key concepts:
//!
//! - **Requeue hint**: when the dispatcher should invoke the reconciler again.
//!   There are no local timers; every wake-up is derived from persisted state.
//! - **Clamp**: bounding a raw replica count to `[min, max]`.
//! - **Convergence**: whether the live target already matches desired state.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs (including `now`)
//! - The floor always wins when bounds are inverted

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Convergence status for a scale target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Target already matches desired state; nothing was written.
    Converged,

    /// An update was issued to move the target toward desired state.
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if an update was issued.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// When the dispatcher should invoke the reconciler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requeue(Duration);

impl Requeue {
    /// Requeue after `delay`.
    pub fn after(delay: Duration) -> Self {
        Self(delay)
    }

    /// Requeue at `deadline`, or immediately if it has already passed.
    pub fn at(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self(until(deadline, now))
    }

    pub fn delay(&self) -> Duration {
        self.0
    }
}

/// Time remaining from `now` until `deadline`, saturating at zero.
pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// `now + delay`, saturating at the latest representable instant.
pub fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Bound `raw` to `[min, max]`.
///
/// `min` is applied last so it wins when `max < min`.
pub fn clamp_replicas(raw: i32, min: i32, max: i32) -> i32 {
    raw.min(max).max(min)
}

/// Consecutive failures of one key inside the current window.
#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    count: u32,
    since: Instant,
}

/// Counts failures per key within a sliding window.
///
/// A key is exhausted once it has failed more than `max_failures` times
/// without the window lapsing or a success clearing it. The caller
/// supplies the clock.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    max_failures: u32,
    window: Duration,
    failures: HashMap<K, FailureWindow>,
}

impl<K: Hash + Eq> RetryTracker<K> {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: HashMap::new(),
        }
    }

    /// Count a failure of `key` at `now`; returns true if it is now exhausted.
    pub fn record_failure(&mut self, key: K, now: Instant) -> bool {
        let window = self.window;
        let entry = self
            .failures
            .entry(key)
            .or_insert(FailureWindow { count: 0, since: now });

        if now.saturating_duration_since(entry.since) > window {
            *entry = FailureWindow { count: 0, since: now };
        }

        entry.count += 1;
        entry.count > self.max_failures
    }

    pub fn is_exhausted(&self, key: &K, now: Instant) -> bool {
        self.failures.get(key).is_some_and(|entry| {
            now.saturating_duration_since(entry.since) <= self.window
                && entry.count > self.max_failures
        })
    }

    /// Forget `key`, typically after it succeeds.
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drop keys whose window has lapsed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.failures
            .retain(|_, entry| now.saturating_duration_since(entry.since) <= window);
    }
}

/// Retry hint used whenever a reconcile errors.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Interval between observations of an in-flight job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Failures tolerated before a key counts as exhausted.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Window over which failures are counted.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clamp_within_bounds() {
        assert_eq!(clamp_replicas(7, 2, 10), 7);
        assert_eq!(clamp_replicas(42, 2, 10), 10);
        assert_eq!(clamp_replicas(-3, 2, 10), 2);
    }

    #[test]
    fn test_clamp_floor_wins_when_inverted() {
        assert_eq!(clamp_replicas(7, 5, 3), 5);
        assert_eq!(clamp_replicas(0, 5, 3), 5);
    }

    #[test]
    fn test_until_saturates() {
        let now = Utc::now();
        assert_eq!(until(now - chrono::Duration::seconds(5), now), Duration::ZERO);
        assert_eq!(
            until(now + chrono::Duration::seconds(5), now),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_requeue_at() {
        let now = Utc::now();
        let hint = Requeue::at(now + chrono::Duration::minutes(1), now);
        assert_eq!(hint.delay(), Duration::from_secs(60));
        assert_eq!(Requeue::at(now, now + chrono::Duration::seconds(1)).delay(), Duration::ZERO);
    }

    #[test]
    fn test_later_saturates() {
        let now = Utc::now();
        assert_eq!(later(now, Duration::from_secs(90)), now + chrono::Duration::seconds(90));
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            later(now, Duration::from_secs(u64::MAX / 4_000)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_retry_tracker_exhausts_after_max_failures() {
        let start = Instant::now();
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("web", start));
        assert!(!tracker.record_failure("web", start));
        assert!(!tracker.record_failure("web", start));
        assert!(tracker.record_failure("web", start));

        assert!(tracker.is_exhausted(&"web", start));
        assert!(!tracker.is_exhausted(&"api", start));

        tracker.clear(&"web");
        assert!(!tracker.is_exhausted(&"web", start));
    }

    #[test]
    fn test_retry_tracker_window_lapses() {
        let start = Instant::now();
        let mut tracker = RetryTracker::new(1, Duration::from_secs(60));
        tracker.record_failure("web", start);
        assert!(tracker.record_failure("web", start));

        let lapsed = start + Duration::from_secs(61);
        assert!(!tracker.is_exhausted(&"web", lapsed));
        assert!(!tracker.record_failure("web", lapsed));
        assert!(tracker.record_failure("web", lapsed));

        tracker.prune(lapsed + Duration::from_secs(61));
        assert!(!tracker.is_exhausted(&"web", lapsed));
    }

    proptest! {
        #[test]
        fn prop_clamp_in_range(raw in any::<i32>(), a in 0i32..1000, b in 0i32..1000) {
            let (min, max) = if a <= b { (a, b) } else { (b, a) };
            let clamped = clamp_replicas(raw, min, max);
            prop_assert!(clamped >= min && clamped <= max);
            prop_assert_eq!(clamped, std::cmp::max(min, std::cmp::min(max, raw)));
        }

        #[test]
        fn prop_clamp_never_below_floor(raw in any::<i32>(), min in 0i32..1000, max in 0i32..1000) {
            prop_assert!(clamp_replicas(raw, min, max) >= min);
        }
    }
}
