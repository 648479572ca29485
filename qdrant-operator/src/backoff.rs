//! Backoff policies shared by watch reconnects, cleanup retries and
//! reconcile re-scheduling.

use std::time::Duration;

use rand::Rng;

/// A resettable source of retry delays.
pub trait Backoff: Iterator<Item = Duration> + Send + Sync + Unpin {
    /// Resets the internal state to the initial value.
    fn reset(&mut self);
}

impl<B: Backoff + ?Sized> Backoff for Box<B> {
    fn reset(&mut self) {
        let this: &mut B = self;
        this.reset();
    }
}

/// Exponential backoff with a delay cap and optional sub-second jitter.
///
/// The attempt counter saturates at `max_attempts` so a long outage does not
/// keep doubling past the cap; [`Backoff::reset`] restores the initial delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    cap: Duration,
    max_attempts: u32,
    attempts: u32,
    jitter: bool,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            cap,
            max_attempts,
            attempts: 0,
            jitter: true,
        }
    }

    /// Disables jitter. Only useful for deterministic tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn delay(&self) -> Duration {
        let exp = self.initial.saturating_mul(1_u32 << self.attempts.min(31));
        let base = exp.min(self.cap);
        if self.jitter {
            base + Duration::from_secs_f64(rand::rng().random_range(0.0..1.0))
        } else {
            base
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.delay();
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        Some(delay)
    }
}

impl Backoff for ExponentialBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Reconnect policy for watch streams.
///
/// Delays follow `min(60s, 2s * 2^attempts)` plus up to a second of jitter.
/// The attempt counter saturates at 10 for rate-limited failures and at 5
/// for everything else, and resets once a stream delivers events again.
#[derive(Debug, Clone)]
pub struct WatchBackoff {
    attempts: u32,
    jitter: bool,
}

const WATCH_INITIAL: Duration = Duration::from_secs(2);
const WATCH_CAP: Duration = Duration::from_secs(60);
const RATE_LIMIT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

impl WatchBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self { attempts: 0, jitter: true }
    }

    #[cfg(test)]
    fn without_jitter() -> Self {
        Self { attempts: 0, jitter: false }
    }

    /// Delay before the next reconnect after a failure of the given class.
    pub fn next_delay(&mut self, rate_limited: bool) -> Duration {
        let exp = WATCH_INITIAL.saturating_mul(1_u32 << self.attempts.min(31));
        let base = exp.min(WATCH_CAP);
        let max_attempts = if rate_limited {
            RATE_LIMIT_MAX_ATTEMPTS
        } else {
            DEFAULT_MAX_ATTEMPTS
        };
        self.attempts = (self.attempts + 1).min(max_attempts);
        if self.jitter {
            base + Duration::from_secs_f64(rand::rng().random_range(0.0..1.0))
        } else {
            base
        }
    }

    /// Called when the stream delivers an event, marking a clean start.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_delays_double_up_to_the_cap() {
        let mut backoff = WatchBackoff::without_jitter();
        assert_eq!(backoff.next_delay(false), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(32));
        // attempts saturate at 5 for non-rate-limited errors
        assert_eq!(backoff.next_delay(false), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(60));
    }

    #[test]
    fn rate_limited_failures_keep_counting_further() {
        let mut backoff = WatchBackoff::without_jitter();
        for _ in 0..12 {
            backoff.next_delay(true);
        }
        assert_eq!(backoff.attempts, RATE_LIMIT_MAX_ATTEMPTS);
    }

    #[test]
    fn clean_start_resets_the_counter() {
        let mut backoff = WatchBackoff::without_jitter();
        backoff.next_delay(false);
        backoff.next_delay(false);
        backoff.reset();
        assert_eq!(backoff.next_delay(false), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_stays_within_a_second_of_the_base() {
        let mut backoff = WatchBackoff::new();
        let delay = backoff.next_delay(false);
        assert!(delay >= Duration::from_secs(2));
        assert!(delay < Duration::from_secs(3));
    }

    #[test]
    fn exponential_backoff_respects_cap_and_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 8)
                .without_jitter();
        let delays: Vec<_> = (0..7).map(|_| backoff.next().unwrap()).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(delays[5], Duration::from_secs(30));
        assert_eq!(delays[6], Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.next().unwrap(), Duration::from_secs(1));
    }
}
