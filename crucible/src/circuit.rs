//! Per-worker circuit breaker: a three-state machine that stops dispatching
//! to a worker that is failing and lets it recover on its own schedule.
//!
//! Grounded in the same "small state machine behind a mutex" shape as the
//! rest of the concurrency model (one lock per owning object, no nested
//! locks): all transitions happen under `Mutex<Inner>` so they stay atomic
//! under concurrent `record_success`/`record_failure` calls from the pool.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// The breaker's externally observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation; failures are being counted.
    Closed,
    /// Refusing execution until `open_timeout` elapses.
    Open,
    /// Probing: a bounded number of calls are allowed through to test recovery.
    HalfOpen,
}

/// Tunable thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before tripping to `Open`.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` before closing.
    pub success_threshold: u32,
    /// Time after the last failure before `Open` transitions to `HalfOpen`.
    pub open_timeout: Duration,
    /// Concurrent probe calls admitted while `HalfOpen`.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

impl crate::provider::FromEnv for CircuitBreakerConfig {
    /// Reads `CRUCIBLE_BREAKER_FAILURE_THRESHOLD`,
    /// `CRUCIBLE_BREAKER_SUCCESS_THRESHOLD`, `CRUCIBLE_BREAKER_OPEN_TIMEOUT_MS`,
    /// and `CRUCIBLE_BREAKER_HALF_OPEN_MAX_PROBES`.
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            failure_threshold: crate::provider::env_or("CRUCIBLE_BREAKER_FAILURE_THRESHOLD", default.failure_threshold),
            success_threshold: crate::provider::env_or("CRUCIBLE_BREAKER_SUCCESS_THRESHOLD", default.success_threshold),
            open_timeout: Duration::from_millis(crate::provider::env_or(
                "CRUCIBLE_BREAKER_OPEN_TIMEOUT_MS",
                u64::try_from(default.open_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            half_open_max_probes: crate::provider::env_or("CRUCIBLE_BREAKER_HALF_OPEN_MAX_PROBES", default.half_open_max_probes),
        }
    }
}

/// A point-in-time snapshot of a breaker's counters, for metrics/inspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures observed in the current state.
    pub consecutive_failures: u32,
    /// Consecutive successes observed in the current state.
    pub consecutive_successes: u32,
    /// Probes currently admitted while `HalfOpen`.
    pub probes_in_half_open: u32,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    probes_in_half_open: u32,
}

/// Per-worker three-state circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("snapshot", &self.snapshot()).finish()
    }
}

/// Whether a call was allowed to even attempt execution, returned by
/// [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed.
    Admitted,
    /// The breaker is open; refuse with `CircuitOpen`.
    Refused,
}

impl CircuitBreaker {
    /// Create a breaker with `config`, starting `Closed`.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                probes_in_half_open: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Decide whether a call may proceed, opening the half-open probe slot
    /// if applicable. Transitions `Open → HalfOpen` here if `open_timeout`
    /// has elapsed since the last failure.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();

        if inner.state == BreakerState::Open
            && inner
                .last_failure_at
                .is_some_and(|t| t.elapsed() >= self.config.open_timeout)
        {
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.consecutive_failures = 0;
            inner.probes_in_half_open = 0;
        }

        match inner.state {
            BreakerState::Closed => Admission::Admitted,
            BreakerState::Open => Admission::Refused,
            BreakerState::HalfOpen => {
                if inner.probes_in_half_open < self.config.half_open_max_probes {
                    inner.probes_in_half_open += 1;
                    Admission::Admitted
                } else {
                    Admission::Refused
                }
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                inner.probes_in_half_open = inner.probes_in_half_open.saturating_sub(1);
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed execution. Returns `true` if this call tripped the
    /// breaker open.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.consecutive_failures = 0;
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.consecutive_successes = 0;
                inner.probes_in_half_open = 0;
                true
            }
            BreakerState::Open => false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// A snapshot of the breaker's counters for metrics.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            probes_in_half_open: inner.probes_in_half_open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(20),
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(config());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Refused);
    }

    #[test]
    fn half_open_admits_bounded_probes_then_closes_on_success_threshold() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));

        assert_eq!(breaker.try_acquire(), Admission::Admitted);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.try_acquire(), Admission::Refused);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.try_acquire(), Admission::Admitted);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failure_during_half_open_reopens() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        breaker.try_acquire();
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn from_env_overrides_failure_threshold() {
        use crate::provider::FromEnv;

        // SAFETY: test-only, no other thread in this process reads this key.
        unsafe { std::env::set_var("CRUCIBLE_BREAKER_FAILURE_THRESHOLD", "9") };
        let config = CircuitBreakerConfig::from_env();
        unsafe { std::env::remove_var("CRUCIBLE_BREAKER_FAILURE_THRESHOLD") };

        assert_eq!(config.failure_threshold, 9);
        assert_eq!(config.success_threshold, CircuitBreakerConfig::default().success_threshold);
    }
}
