//! Respawn policy for supervised reconciler tasks.
//!
//! A supervisor that keeps one task alive per resource uses:
//!
//! - [`RespawnBudget`] to count crashes per resource and decide when to stop
//!   respawning it;
//! - [`RespawnBackoff`] to space respawns out.
//!
//! ```
//! use std::time::Duration;
//! use corral_reconcile::{RespawnBackoff, RespawnBudget};
//!
//! let mut budget = RespawnBudget::new(2, Duration::from_secs(60));
//! let backoff = RespawnBackoff::default();
//!
//! assert!(!budget.record_failure(&"web-1"));
//! let wait = backoff.delay(budget.attempts(&"web-1") - 1);
//! assert!(wait <= backoff.ceiling);
//!
//! assert!(!budget.record_failure(&"web-1"));
//! assert!(budget.record_failure(&"web-1"));
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// Respawns allowed per resource inside [`DEFAULT_RESPAWN_WINDOW`].
pub const DEFAULT_RESPAWN_LIMIT: u32 = 3;

/// How long crashes count against a resource.
pub const DEFAULT_RESPAWN_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Delay before the n-th respawn: `initial * 2^n`, capped at `ceiling`, then
/// spread by up to `jitter` of itself either way.
#[derive(Debug, Clone, PartialEq)]
pub struct RespawnBackoff {
    pub initial: Duration,
    pub ceiling: Duration,
    /// Fraction in `0.0..=1.0`; out-of-range values are clamped.
    pub jitter: f64,
}

impl Default for RespawnBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RespawnBackoff {
    /// `attempt` is 0 for the first respawn.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(factor).min(self.ceiling);

        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return delay;
        }
        let scale = rand::rng().random_range(1.0 - spread..=1.0 + spread);
        delay.mul_f64(scale)
    }
}

/// Crashes of one resource since its window opened.
#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    failures: u32,
    opened_at: Instant,
}

impl FailureWindow {
    fn is_open(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.opened_at) <= window
    }
}

/// Per-resource crash counter with a fixed window.
///
/// The window opens at a resource's first crash. Crashes after it closes
/// start a new one, so a resource that fails rarely is respawned forever
/// while one that crash-loops runs out of budget.
#[derive(Debug, Clone)]
pub struct RespawnBudget<K> {
    limit: u32,
    window: Duration,
    windows: BTreeMap<K, FailureWindow>,
}

impl<K: Ord + Clone> RespawnBudget<K> {
    /// Allows `limit` respawns per resource within `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: BTreeMap::new(),
        }
    }

    /// Counts a crash of `key`. Returns true once it has crashed more than
    /// `limit` times in the current window and should not be respawned.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let window = self.window;
        let entry = self
            .windows
            .entry(key.clone())
            .and_modify(|open| {
                if !open.is_open(now, window) {
                    *open = FailureWindow {
                        failures: 0,
                        opened_at: now,
                    };
                }
            })
            .or_insert(FailureWindow {
                failures: 0,
                opened_at: now,
            });

        entry.failures = entry.failures.saturating_add(1);
        entry.failures > self.limit
    }

    /// Crashes of `key` in its open window; 0 once the window has closed.
    pub fn attempts(&self, key: &K) -> u32 {
        self.windows
            .get(key)
            .filter(|open| open.is_open(Instant::now(), self.window))
            .map_or(0, |open| open.failures)
    }

    pub fn is_exhausted(&self, key: &K) -> bool {
        self.attempts(key) > self.limit
    }

    /// Forgets `key`, e.g. after its task finished cleanly.
    pub fn clear(&mut self, key: &K) {
        self.windows.remove(key);
    }

    /// Drops every closed window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.windows.retain(|_, open| open.is_open(now, window));
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, ceiling_ms: u64) -> RespawnBackoff {
        RespawnBackoff {
            initial: Duration::from_millis(initial_ms),
            ceiling: Duration::from_millis(ceiling_ms),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let backoff = fixed(100, 30_000);

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_delay_stops_at_ceiling() {
        let backoff = fixed(1000, 5000);

        assert_eq!(backoff.delay(3), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = RespawnBackoff::default();
        for _ in 0..200 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[test]
    fn test_budget_runs_out_after_limit() {
        let mut budget = RespawnBudget::new(2, Duration::from_secs(60));

        assert!(!budget.record_failure(&"web-1"));
        assert!(!budget.record_failure(&"web-1"));
        assert!(budget.record_failure(&"web-1"));

        assert!(budget.is_exhausted(&"web-1"));
        assert_eq!(budget.attempts(&"web-1"), 3);
        assert!(!budget.is_exhausted(&"web-2"));
        assert_eq!(budget.attempts(&"web-2"), 0);
    }

    #[test]
    fn test_clear_forgets_resource() {
        let mut budget = RespawnBudget::new(0, Duration::from_secs(60));
        assert!(budget.record_failure(&7u64));

        budget.clear(&7u64);
        assert_eq!(budget.tracked(), 0);
        assert!(!budget.is_exhausted(&7u64));
    }

    #[test]
    fn test_closed_window_starts_over() {
        let mut budget = RespawnBudget::new(1, Duration::ZERO);
        assert!(!budget.record_failure(&"web-1"));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(budget.attempts(&"web-1"), 0);
        assert!(!budget.record_failure(&"web-1"));
        assert_eq!(budget.tracked(), 1);

        std::thread::sleep(Duration::from_millis(5));
        budget.prune();
        assert_eq!(budget.tracked(), 0);
    }
}
