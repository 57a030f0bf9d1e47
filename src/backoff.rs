/// Exponential backoff with randomized jitter, for gateway reconnects.
use std::time::Duration;

use rand::Rng;

/// Reconnect schedule: 500 ms doubling to a 15 s ceiling, ±25% jitter.
pub const INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const MAX_DELAY: Duration = Duration::from_secs(15);
pub const FACTOR: f64 = 2.0;

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }

    /// Backoff with the gateway reconnect parameters.
    #[must_use]
    pub const fn gateway() -> Self {
        Self::new(INITIAL_DELAY, MAX_DELAY, FACTOR)
    }

    /// Compute the next delay (with jitter) and advance the internal state.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn next_delay(&mut self) -> Duration {
        let current_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;

        // Apply jitter to the current delay before advancing.
        let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
        let jittered_ms = (current_ms as f64 * jitter_factor) as u64;
        let delay = Duration::from_millis(jittered_ms);

        let next_ms = (current_ms as f64 * self.factor) as u64;
        let next = Duration::from_millis(next_ms.min(self.max.as_millis() as u64));
        self.current = next.min(self.max);

        delay
    }

    /// Reset to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::gateway()
    }
}
