use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crossbar_core::config::{BackoffConfig, RetryConfig};
use crossbar_core::{GatewayError, Result};

/// Caller-supplied override for the retry decision.
pub type RetryPredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

/// Invokes an operation up to `max_attempts` times with jittered backoff
/// between failures.
///
/// Only retryable errors are retried: the taxonomy's retryable codes, any
/// extra codes in the config, or whatever a caller predicate admits.
/// Non-retryable errors propagate unchanged, and the executor adds no
/// timeouts of its own.
pub struct RetryExecutor {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
        }
    }

    /// Replace the error classification with a caller-supplied predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Run `op` until it succeeds or retries are exhausted. The closure
    /// receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt == max_attempts || !self.is_retryable(&err) {
                        return Err(err);
                    }
                    if let Some(cap) = self.config.max_total_duration() {
                        if started.elapsed() >= cap {
                            warn!(attempt, "retry budget exhausted by total duration");
                            return Err(err);
                        }
                    }
                    let delay = self.backoff_delay(attempt - 1);
                    debug!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop exits via return")
    }

    fn is_retryable(&self, err: &GatewayError) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(err);
        }
        err.retryable() || self.config.retryable_error_codes.contains(&err.code())
    }

    /// Delay after the `i`-th failed attempt (0-based), jitter applied.
    fn backoff_delay(&self, i: u32) -> Duration {
        let base_ms = match &self.config.backoff {
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let raw = (*initial_ms as f64) * multiplier.powi(i as i32);
                raw.min(*max_ms as f64) as u64
            }
            BackoffConfig::Linear {
                initial_ms,
                step_ms,
                max_ms,
            } => initial_ms
                .saturating_add(step_ms.saturating_mul(i as u64))
                .min(*max_ms),
            BackoffConfig::Fixed { delay_ms } => *delay_ms,
        };
        apply_jitter(base_ms, self.config.jitter)
    }
}

/// Scale `base_ms` by a uniform factor in `[1 - jitter, 1 + jitter]`.
///
/// The pseudo-random value is derived from the current wall clock's
/// subsecond nanos, avoiding a rand dependency.
fn apply_jitter(base_ms: u64, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || base_ms == 0 {
        return Duration::from_millis(base_ms);
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    // Uniform in [-1.0, 1.0] from the low bits.
    let unit = ((nanos % 2_001) as f64 / 1_000.0) - 1.0;
    let factor = 1.0 + jitter * unit;
    Duration::from_millis((base_ms as f64 * factor).max(0.0) as u64)
}
