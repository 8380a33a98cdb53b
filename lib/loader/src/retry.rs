use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How often to try something and how long to wait between tries.
///
/// The wait is drawn uniformly from `[min_delay, max_delay]` so that
/// processes which failed at the same moment don't retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: usize,
    #[serde(with = "crate::config::duration")]
    pub min_delay: Duration,
    #[serde(with = "crate::config::duration")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: usize, min_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            attempts,
            min_delay,
            max_delay,
        }
    }

    /// A policy that tries `attempts` times without ever sleeping.
    pub const fn immediate(attempts: usize) -> Self {
        RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    /// The number of attempts, never less than one.
    pub fn max_attempts(&self) -> usize {
        self.attempts.max(1)
    }

    pub fn jittered_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }

        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub(crate) fn pause(&self) {
        let delay = self.jittered_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_in_window() {
        let policy = RetryPolicy::new(3, Duration::from_millis(600), Duration::from_millis(2000));

        for _ in 0..100 {
            let delay = policy.jittered_delay();
            assert!(delay >= Duration::from_millis(600), "{delay:?}");
            assert!(delay <= Duration::from_millis(2000), "{delay:?}");
        }
    }

    #[test]
    fn inverted_window_uses_the_minimum() {
        let policy = RetryPolicy::new(1, Duration::from_secs(2), Duration::from_secs(1));

        assert_eq!(policy.jittered_delay(), Duration::from_secs(2));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts(), 1);
    }
}
