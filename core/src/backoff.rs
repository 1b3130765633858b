//! Exponential backoff for approval polling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a multiplier and an upper bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial`, growing by `multiplier`, capped at `max`.
    ///
    /// Multipliers below 1.0 are treated as 1.0.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            max,
            multiplier: multiplier.max(1.0),
            current: initial.min(max),
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next interval and returns the one just used.
    pub fn advance(&mut self) -> Duration {
        let used = self.current;
        // Overflowing or non-finite products saturate at the cap.
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = next.min(self.max);
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_initial() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300), 2.0);
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_by_multiplier() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300), 2.0);
        assert_eq!(backoff.advance(), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_secs(10));
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_secs(20));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(100), Duration::from_secs(300), 2.0);
        backoff.advance(); // 200
        backoff.advance(); // 400 -> 300
        assert_eq!(backoff.current(), Duration::from_secs(300));
    }

    #[test]
    fn backoff_never_shrinks() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.5);
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_secs(10));
    }

    #[test]
    fn huge_multiplier_saturates_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(60), 1e30);
        assert_eq!(backoff.advance(), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_secs(60));
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }

    #[test]
    fn infinite_multiplier_saturates_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(60), f64::INFINITY);
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_secs(60));
    }
}
