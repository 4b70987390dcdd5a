//! Per-device circuit breaker
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[cooldown elapsed, next call admitted as trial]--> HalfOpen
//! HalfOpen --[trial succeeds]--> Closed
//! HalfOpen --[trial fails]--> Open (cooldown restarts)
//! ```
//!
//! While open, calls are rejected without touching the device. Only one
//! trial is admitted at a time in half-open.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    last_error: Option<String>,
    rejected: u64,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
            last_error: None,
            rejected: 0,
        }
    }
}

/// Point-in-time view for stats and health reports
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub rejected: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitBreakerInner::new()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask permission to call the device
    ///
    /// Returns `false` when the call must be rejected without I/O.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    info!("Circuit half-open, admitting trial call");
                }
                cooled
            },
            CircuitState::HalfOpen => {
                // A trial abandoned mid-flight must not wedge the breaker
                let stale = inner
                    .trial_started
                    .map_or(true, |at| now.duration_since(at) >= self.config.cooldown);
                if stale {
                    inner.trial_started = Some(now);
                }
                stale
            },
        };
        if !admitted {
            inner.rejected += 1;
        }
        admitted
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    pub fn on_failure(&self, error: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_error = Some(error.to_string());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "Circuit opened after {} consecutive failures: {}",
                inner.consecutive_failures, error
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.trial_started = None;
        }
    }

    /// End an admitted call that neither proved nor disproved the device,
    /// freeing the half-open trial slot without changing counters
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_started = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Force the circuit closed, e.g. after a manual connection reset
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = CircuitBreakerInner {
            rejected: inner.rejected,
            ..CircuitBreakerInner::new()
        };
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            rejected: inner.rejected,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1_000);
        for _ in 0..2 {
            assert!(cb.try_acquire());
            cb.on_failure("timeout");
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.try_acquire());
        cb.on_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
        assert_eq!(cb.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_then_close() {
        let cb = breaker(1, 1_000);
        cb.on_failure("refused");
        assert!(!cb.try_acquire());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second caller while the trial is running
        assert!(!cb.try_acquire());

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let cb = breaker(1, 1_000);
        cb.on_failure("refused");
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cb.try_acquire());
        cb.on_failure("refused again");
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!cb.try_acquire());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.try_acquire());
        assert_eq!(cb.last_error().as_deref(), Some("refused again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(2, 1_000);
        cb.on_failure("x");
        cb.on_success();
        cb.on_failure("x");
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.on_failure("x");
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
