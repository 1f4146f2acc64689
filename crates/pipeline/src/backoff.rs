//! Retry delay between connection attempts.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::time::Duration;

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(20);
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Doubling delay, capped at `max_wait`, reset by [`Backoff::success`].
///
/// The first wait after construction or a success is zero so that the first
/// connection attempt is immediate.
#[derive(Debug)]
pub struct Backoff {
    max_wait: Duration,
    last_wait: Option<Duration>,
    delays: ExponentialBackoff,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WAIT)
    }
}

impl Backoff {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            max_wait,
            last_wait: None,
            delays: schedule(max_wait),
        }
    }

    /// Delay to sleep before the next attempt.
    pub fn wait(&mut self) -> Duration {
        let next = match self.last_wait {
            None => Duration::ZERO,
            Some(_) => self.delays.next().unwrap_or(self.max_wait).min(self.max_wait),
        };
        self.last_wait = Some(next);
        next
    }

    pub fn success(&mut self) {
        self.last_wait = None;
        self.delays = schedule(self.max_wait);
    }

    pub fn last_wait(&self) -> Duration {
        self.last_wait.unwrap_or_default()
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

fn schedule(max_wait: Duration) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(MIN_WAIT.min(max_wait))
        .with_max_delay(max_wait)
        .with_factor(2.0)
        .with_max_times(usize::MAX)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(20));
        let waits: Vec<u64> = (0..8).map(|_| backoff.wait().as_secs()).collect();
        assert_eq!(waits, vec![0, 1, 2, 4, 8, 16, 20, 20]);
        assert_eq!(backoff.last_wait(), Duration::from_secs(20));
    }

    #[test]
    fn test_waits_are_monotonic() {
        let mut backoff = Backoff::new(Duration::from_secs(7));
        let mut prev = Duration::ZERO;
        for _ in 0..20 {
            let wait = backoff.wait();
            assert!(wait >= prev);
            assert!(wait <= backoff.max_wait());
            prev = wait;
        }
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = Backoff::default();
        backoff.wait();
        backoff.wait();
        assert_eq!(backoff.wait(), Duration::from_secs(2));

        backoff.success();
        assert_eq!(backoff.last_wait(), Duration::ZERO);
        assert_eq!(backoff.wait(), Duration::ZERO);
        assert_eq!(backoff.wait(), Duration::from_secs(1));
    }
}
