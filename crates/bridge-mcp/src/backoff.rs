use rand::Rng;
use std::time::Duration;

/// Exponential retry backoff with full jitter: attempt `k` sleeps a uniform
/// random duration in `[0, min(initial * multiplier^k, max)]`.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max,
        }
    }

    /// Deterministic ceiling for a given attempt (0-indexed).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Jittered delay for a given attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_grows_exponentially_and_caps() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(5));
        assert_eq!(backoff.ceiling(0), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(400));
        assert_eq!(backoff.ceiling(10), Duration::from_secs(5)); // capped
    }

    #[test]
    fn test_delay_stays_under_ceiling() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(5));
        for attempt in 0..6 {
            for _ in 0..100 {
                assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
            }
        }
    }

    #[test]
    fn test_multiplier_below_one_is_clamped() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), 0.5, Duration::from_secs(5));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(100));
    }
}
