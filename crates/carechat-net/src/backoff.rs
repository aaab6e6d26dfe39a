//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use carechat_shared::constants::{
    DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_JITTER, DEFAULT_RECONNECT_MAX_MS,
};

/// Tuning parameters for reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Fraction of the delay randomised in either direction (0.0 disables).
    pub jitter: f64,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            multiplier: 2.0,
            jitter: DEFAULT_RECONNECT_JITTER,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for `attempt` (1-based) before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt` (1-based) with jitter applied, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        let millis = base.as_millis() as f64 * (1.0 + spread);
        let millis = millis.clamp(0.0, self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    #[test]
    fn grows_exponentially_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = ReconnectPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..200 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(300));
        }
        for _ in 0..200 {
            assert!(p.delay_for(10) <= Duration::from_millis(1_000));
        }
    }
}
