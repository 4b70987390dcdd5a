//! Retry policy with exponential backoff and jitter

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first (minimum 1)
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Ceiling for any single backoff, jitter included
    pub max_backoff: Duration,
    /// Backoff multiplier per attempt
    pub backoff_factor: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create from configuration values
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            backoff_factor: config.backoff_factor.max(1.0),
            jitter: true,
        }
    }

    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    /// Deterministic policy for tests
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Base delay after failed attempt `attempt` (1-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay after failed attempt `attempt`: base plus up to 50% jitter,
    /// capped at `max_backoff`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        (base + Duration::from_millis(jitter_ms)).min(self.max_backoff)
    }

    /// Upper bound of total sleep across one call's retries
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| {
                let base = self.base_delay(attempt);
                (base + base / 2).min(self.max_backoff)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_factor: 2.0,
        })
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let p = policy().without_jitter();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_bounded() {
        let p = policy();
        for _ in 0..200 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));

            let d = p.delay_for(4);
            assert!(d <= p.max_backoff);
        }
    }

    #[test]
    fn test_worst_case_bounded_by_max_backoff() {
        let p = policy();
        assert!(p.worst_case_delay() <= p.max_backoff * p.max_attempts);
        assert_eq!(RetryPolicy::no_retry().worst_case_delay(), Duration::ZERO);
    }

    #[test]
    fn test_zero_retries_clamped_to_one_attempt() {
        let p = RetryPolicy::from_config(&RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        assert_eq!(p.max_attempts, 1);
    }
}
