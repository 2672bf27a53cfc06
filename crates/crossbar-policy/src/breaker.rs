use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crossbar_core::config::CircuitBreakerConfig;
use crossbar_core::{ErrorCode, GatewayError, Result};

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Internal state with per-state bookkeeping.
#[derive(Debug)]
enum State {
    /// Normal operation — failure timestamps within the rolling window.
    Closed { failures: Vec<Instant> },
    /// Tripped — rejecting until the recovery timeout elapses.
    Open { opened_at: Instant },
    /// Probing — consecutive successes counted toward reclosing.
    HalfOpen { successes: u32 },
}

impl State {
    fn closed() -> Self {
        State::Closed {
            failures: Vec::new(),
        }
    }
}

/// Classical three-state circuit breaker.
///
/// Failures only count when their error code is in `trigger_errors`.
/// The open→half-open move is lazy: it happens on the next admission
/// check after the recovery timeout, not on a timer.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::closed()),
        }
    }

    pub fn state(&self) -> CircuitState {
        match &*self.state.lock().expect("breaker mutex poisoned") {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Whether a call would currently be admitted, moving open→half-open
    /// when the recovery timeout has elapsed.
    pub fn is_allowed(&self) -> bool {
        self.check_admission().is_ok()
    }

    /// Admission check: `closed` and `half-open` admit; `open` rejects
    /// until the recovery timeout has elapsed.
    pub fn check_admission(&self) -> Result<()> {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &*state {
            State::Closed { .. } | State::HalfOpen { .. } => Ok(()),
            State::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.recovery_timeout() {
                    info!("circuit half-open, admitting probes");
                    *state = State::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    let remaining = self.config.recovery_timeout() - elapsed;
                    Err(GatewayError::CircuitOpen {
                        retry_in_ms: remaining.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed { failures } => failures.clear(),
            State::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    info!("circuit closed after successful probes");
                    *state = State::closed();
                }
            }
            State::Open { .. } => {}
        }
    }

    /// Record a failed call. Only trigger-error codes count.
    pub fn record_failure(&self, code: ErrorCode) {
        if !self.config.trigger_errors.contains(&code) {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed { failures } => {
                failures.push(now);
                let window = self.config.failure_window();
                failures.retain(|t| now.duration_since(*t) < window);
                if failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        failures = failures.len(),
                        cooldown_ms = self.config.recovery_timeout_ms,
                        "circuit tripped"
                    );
                    *state = State::Open { opened_at: now };
                }
            }
            State::HalfOpen { .. } => {
                warn!("half-open probe failed, circuit re-tripped");
                *state = State::Open { opened_at: now };
            }
            State::Open { .. } => {}
        }
    }

    /// Operational override: force the circuit open.
    pub fn open(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        *state = State::Open {
            opened_at: Instant::now(),
        };
    }

    /// Operational override: force the circuit closed.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        *state = State::closed();
    }

    /// Clear all counters and return to `closed`.
    pub fn reset(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 60_000,
            recovery_timeout_ms: 500,
            success_threshold: 2,
            ..CircuitBreakerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_failures_trip_the_circuit() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            assert!(cb.is_allowed());
            cb.record_failure(ErrorCode::ServerError);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.check_admission().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn non_trigger_codes_do_not_count() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..10 {
            cb.record_failure(ErrorCode::InvalidRequest);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_closed_failure_count() {
        let cb = CircuitBreaker::new(config());
        cb.record_failure(ErrorCode::ServerError);
        cb.record_failure(ErrorCode::ServerError);
        cb.record_success();
        cb.record_failure(ErrorCode::ServerError);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trips_recovers_and_closes() {
        // S3: trip with 3 failures, reject while open, probe after 500ms,
        // two successes close the circuit.
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure(ErrorCode::ServerError);
        }
        assert!(!cb.is_allowed());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.is_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_for_full_recovery_timeout() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure(ErrorCode::Timeout);
        }
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!cb.is_allowed());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_retrips_and_resets_clock() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure(ErrorCode::ServerError);
        }
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.is_allowed());

        cb.record_failure(ErrorCode::ServerError);
        assert_eq!(cb.state(), CircuitState::Open);
        // Clock restarted: still open just before the new deadline.
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!cb.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_age_out_of_the_window() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_window_ms: 1_000,
            ..config()
        });
        cb.record_failure(ErrorCode::ServerError);
        cb.record_failure(ErrorCode::ServerError);
        tokio::time::advance(Duration::from_millis(1_100)).await;
        // The earlier failures fell out of the window, so this third one
        // does not trip.
        cb.record_failure(ErrorCode::ServerError);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_overrides() {
        let cb = CircuitBreaker::new(config());
        cb.open();
        assert!(!cb.is_allowed());
        cb.close();
        assert!(cb.is_allowed());
        cb.open();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
