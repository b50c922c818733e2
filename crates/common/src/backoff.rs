use rand::Rng;
use std::time::Duration;

/// Jittered exponential backoff for retrying venue calls.
///
/// Delay for attempt `n` is `min(max_delay, base * 2^n)` plus a random
/// jitter of up to `jitter_factor` of the capped delay in either
/// direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60)).with_jitter(0.25)
    }
}

impl ExponentialBackoff {
    /// Create a backoff schedule with no jitter.
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: 0.0,
            attempt: 0,
        }
    }

    /// Set the jitter fraction (clamped to `[0, 1]`).
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay for a given attempt number, without jitter or state.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter_factor == 0.0 {
            return capped;
        }

        let spread = capped.as_secs_f64() * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    /// Reset after a successful call.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(4));

        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        // Capped from here on.
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60))
            .with_jitter(0.25);

        for _ in 0..20 {
            backoff.reset();
            let secs = backoff.next_delay().as_secs_f64();
            assert!((7.5..=12.5).contains(&secs), "delay {secs} out of bounds");
        }
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(-2.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
