//! # Circuit breaker (ambient fault isolation, SPEC_FULL.md §4.3/4.4)
//!
//! Not a spec.md requirement — store/bus calls work fine without it. Every
//! external dependency (database, messaging) can be wrapped in the same
//! `CircuitBreakerBehavior` trait, so orchestration code that calls a flaky
//! Postgres or PGMQ instance benefits from the same fail-fast behavior.
//! Gated behind `CoreConfig::circuit_breaker` (default: disabled) so a
//! minimal deployment can ignore it entirely.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub current_state: CircuitState,
}

/// Unified interface so bus and store protection can be reported on
/// uniformly (e.g. a combined health endpoint) without downcasting.
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self, duration: Duration);
    fn record_failure(&self, duration: Duration);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

const STATE_CLOSED: u32 = 0;
const STATE_OPEN: u32 = 1;
const STATE_HALF_OPEN: u32 = 2;

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU32::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    fn raw_state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub fn force_open(&self) {
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        *self.opened_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    pub fn force_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
    }

    /// Record success/failure without a measured duration (for call sites
    /// that only know pass/fail, not elapsed time).
    pub fn record_success_manual(&self, duration: Duration) {
        self.record_success(duration);
    }

    pub fn record_failure_manual(&self, duration: Duration) {
        self.record_failure(duration);
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        match self.raw_state() {
            STATE_CLOSED => CircuitState::Closed,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    fn should_allow(&self) -> bool {
        match self.raw_state() {
            STATE_CLOSED => true,
            STATE_HALF_OPEN => true,
            _ => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    self.state.store(STATE_HALF_OPEN, Ordering::SeqCst);
                    self.half_open_successes.store(0, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, _duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);

        match self.raw_state() {
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.force_closed();
                }
            }
            _ => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
        }
    }

    fn record_failure(&self, _duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);

        match self.raw_state() {
            STATE_HALF_OPEN => self.force_open(),
            _ => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.force_open();
                }
            }
        }
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            current_state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                timeout: Duration::from_millis(timeout_ms),
                success_threshold,
            },
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, 1, 50);
        assert_eq!(cb.state(), CircuitState::Closed);
        for _ in 0..3 {
            cb.record_failure(Duration::ZERO);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success() {
        let cb = breaker(1, 1, 10);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, 2, 10);
        cb.record_failure(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_allow());
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_open_and_closed() {
        let cb = breaker(5, 1, 1000);
        cb.force_open();
        assert!(!cb.should_allow());
        cb.force_closed();
        assert!(cb.should_allow());
    }
}
