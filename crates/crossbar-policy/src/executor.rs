use std::future::Future;
use std::time::Duration;

use crossbar_core::config::{ChannelPolicy, TimeoutClass};
use crossbar_core::Result;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::rate_limit::{RateLimiter, RateScopes};
use crate::retry::RetryExecutor;
use crate::timeout::TimeoutExecutor;

/// The composed per-operation policy:
///
/// ```text
/// operation_timeout → retry → rate_limit.acquire → circuit_breaker.guard(op)
/// ```
///
/// The operation timeout bounds the total duration including every retry
/// and limiter wait. The breaker admission check runs before the limiter
/// so an open circuit never consumes a token.
pub struct PolicyExecutor {
    limiter: RateLimiter,
    retry: RetryExecutor,
    breaker: CircuitBreaker,
    timeouts: TimeoutExecutor,
}

impl PolicyExecutor {
    pub fn new(policy: &ChannelPolicy) -> Self {
        Self {
            limiter: RateLimiter::new(policy.rate_limit.clone()),
            retry: RetryExecutor::new(policy.retry.clone()),
            breaker: CircuitBreaker::new(policy.circuit_breaker.clone()),
            timeouts: TimeoutExecutor::new(policy.timeout.clone()),
        }
    }

    /// Run `op` under the full policy. The closure is invoked once per
    /// retry attempt and must produce a fresh future each time.
    pub async fn execute<T, F, Fut>(&self, scopes: &RateScopes, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let duration = self.timeouts.duration(TimeoutClass::Operation);
        self.execute_inner(Some(scopes), duration, op).await
    }

    /// Run `op` under retry/breaker/timeout but skip admission control.
    pub async fn execute_without_rate_limit<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let duration = self.timeouts.duration(TimeoutClass::Operation);
        self.execute_inner(None, duration, op).await
    }

    /// Run `op` under the full policy with a custom operation deadline.
    pub async fn execute_with_timeout<T, F, Fut>(
        &self,
        scopes: &RateScopes,
        timeout: Duration,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_inner(Some(scopes), timeout, op).await
    }

    async fn execute_inner<T, F, Fut>(
        &self,
        scopes: Option<&RateScopes>,
        timeout: Duration,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.timeouts
            .run_with(TimeoutClass::Operation, timeout, async {
                self.retry
                    .execute(|_attempt| async {
                        self.breaker.check_admission()?;
                        if let Some(scopes) = scopes {
                            self.limiter.acquire(scopes).await?;
                        }
                        match op().await {
                            Ok(value) => {
                                self.breaker.record_success();
                                Ok(value)
                            }
                            Err(err) => {
                                self.breaker.record_failure(err.code());
                                Err(err)
                            }
                        }
                    })
                    .await
            })
            .await
    }

    /// Fail-fast check for callers that want to skip the timeout budget
    /// entirely when the circuit is open.
    pub fn is_circuit_allowed(&self) -> bool {
        self.breaker.is_allowed()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Clear limiter buckets and the breaker. In-flight operations are
    /// not cancelled.
    pub fn reset(&self) {
        self.limiter.reset();
        self.breaker.reset();
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbar_core::config::{
        BackoffConfig, BucketConfig, CircuitBreakerConfig, RateLimitAction, RateLimitConfig,
        RetryConfig, TimeoutConfig,
    };
    use crossbar_core::{ErrorCode, GatewayError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> ChannelPolicy {
        ChannelPolicy {
            rate_limit: RateLimitConfig {
                global: BucketConfig::new(100, 1_000, 0),
                per_conversation: None,
                per_user: None,
                action: RateLimitAction::Delay,
            },
            retry: RetryConfig {
                max_attempts: 3,
                backoff: BackoffConfig::Fixed { delay_ms: 10 },
                jitter: 0.0,
                retryable_error_codes: Vec::new(),
                max_total_duration_ms: None,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 500,
                success_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
            timeout: TimeoutConfig {
                operation_ms: 60_000,
                ..TimeoutConfig::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_passes_through() {
        let exec = PolicyExecutor::new(&policy());
        let out = exec
            .execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_bounds_retries() {
        let mut p = policy();
        p.timeout.operation_ms = 100;
        p.retry.max_attempts = 50;
        p.retry.backoff = BackoffConfig::Fixed { delay_ms: 40 };
        let exec = PolicyExecutor::new(&p);

        let started = Instant::now();
        let err = exec
            .execute(&RateScopes::default(), || async {
                Err::<(), _>(GatewayError::Network("down".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(started.elapsed() <= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_consuming_tokens() {
        let mut p = policy();
        // One-token bucket: a consumed token would be observable.
        p.rate_limit.global = BucketConfig::new(1, 60_000, 0);
        p.rate_limit.action = RateLimitAction::Reject;
        p.retry.max_attempts = 1;
        let exec = PolicyExecutor::new(&p);

        exec.breaker().open();
        let err = exec
            .execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);

        // The bucket still has its token: closing the circuit lets the
        // next call through without a rate-limit rejection.
        exec.breaker().close();
        exec.execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_trips_through_the_executor() {
        // S3 through the composed path: three server errors trip, the
        // fourth call is rejected without invoking the operation.
        let mut p = policy();
        p.retry.max_attempts = 1;
        let exec = PolicyExecutor::new(&p);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = exec
                .execute(&RateScopes::default(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(GatewayError::Server("500".into())) }
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = exec
            .execute(&RateScopes::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, GatewayError>(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Recovery: wait out the cooldown, then two successes reclose.
        tokio::time::advance(Duration::from_millis(500)).await;
        for _ in 0..2 {
            exec.execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(()) })
                .await
                .unwrap();
        }
        assert_eq!(exec.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn without_rate_limit_skips_admission() {
        let mut p = policy();
        p.rate_limit.global = BucketConfig::new(1, 60_000, 0);
        p.rate_limit.action = RateLimitAction::Reject;
        let exec = PolicyExecutor::new(&p);

        // Burn the only token.
        exec.execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();

        // The unlimited path still goes through.
        exec.execute_without_rate_limit(|| async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_buckets_and_breaker() {
        let mut p = policy();
        p.rate_limit.global = BucketConfig::new(1, 60_000, 0);
        p.rate_limit.action = RateLimitAction::Reject;
        p.retry.max_attempts = 1;
        let exec = PolicyExecutor::new(&p);

        exec.execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();
        exec.breaker().open();

        exec.reset();
        assert!(exec.is_circuit_allowed());
        exec.execute(&RateScopes::default(), || async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();
    }
}
