use dashmap::DashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crossbar_core::config::{BucketConfig, RateLimitAction, RateLimitConfig};
use crossbar_core::{GatewayError, Result};

/// Token bucket with demand-driven refill.
///
/// `capacity` tokens are added per `refill_window`; the bucket may hold up
/// to `capacity + burst` tokens. There is no background timer: refill is
/// computed from elapsed whole windows on each consume attempt.
#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    burst: u32,
    refill_window: Duration,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(cfg: &BucketConfig) -> Self {
        Self {
            capacity: cfg.capacity,
            burst: cfg.burst,
            refill_window: cfg.refill_window(),
            // Starts full, including the burst allowance.
            tokens: cfg.capacity + cfg.burst,
            last_refill: Instant::now(),
        }
    }

    /// Consume one token, or return how long to wait for the next refill.
    fn try_consume(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            Err(self.retry_after())
        }
    }

    fn refill(&mut self, now: Instant) {
        let window_ms = self.refill_window.as_millis().max(1) as u64;
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as u64;
        let periods = elapsed_ms / window_ms;
        if periods > 0 {
            let added = (periods as u32).saturating_mul(self.capacity);
            self.tokens = self.tokens.saturating_add(added).min(self.capacity + self.burst);
            self.last_refill = now;
        }
    }

    /// Admission hint when empty: one window divided by capacity, rounded up.
    fn retry_after(&self) -> Duration {
        let window_ms = self.refill_window.as_millis().max(1) as u64;
        let per_token = window_ms.div_ceil(self.capacity.max(1) as u64);
        Duration::from_millis(per_token)
    }
}

/// Which scope denied admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Global,
    Conversation,
    User,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateScope::Global => "global",
            RateScope::Conversation => "conversation",
            RateScope::User => "user",
        };
        f.write_str(s)
    }
}

/// Scope keys for one admission request. Absent keys skip that scope even
/// when it is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateScopes {
    pub conversation: Option<String>,
    pub user: Option<String>,
}

impl RateScopes {
    pub fn conversation(key: impl Into<String>) -> Self {
        Self {
            conversation: Some(key.into()),
            user: None,
        }
    }

    pub fn and_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Multi-scope rate limiter: global → per-conversation → per-user, with
/// short-circuit denial at the first failing scope.
///
/// Shared across tasks; every bucket operation is a short critical
/// section. Fairness is not promised — under contention consumers race
/// for tokens.
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Mutex<TokenBucket>,
    per_conversation: DashMap<String, TokenBucket>,
    per_user: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = Mutex::new(TokenBucket::new(&config.global));
        Self {
            config,
            global,
            per_conversation: DashMap::new(),
            per_user: DashMap::new(),
        }
    }

    /// Admit one request, honoring the configured empty-bucket action.
    ///
    /// With `delay`, this sleeps for the retry-after hint and retries until
    /// admitted — callers bound the wait with the operation timeout. With
    /// `reject` and `queue` it fails on the first denial.
    pub async fn acquire(&self, scopes: &RateScopes) -> Result<()> {
        loop {
            match self.try_acquire(scopes) {
                Ok(()) => return Ok(()),
                Err((scope, retry_after)) => match self.config.action {
                    RateLimitAction::Delay => {
                        debug!(%scope, wait_ms = retry_after.as_millis() as u64, "rate limited, delaying");
                        sleep(retry_after).await;
                    }
                    RateLimitAction::Reject => {
                        return Err(GatewayError::RateLimited {
                            scope: scope.to_string(),
                            retry_after_ms: retry_after.as_millis() as u64,
                        })
                    }
                    RateLimitAction::Queue => {
                        return Err(GatewayError::RateLimitQueued {
                            scope: scope.to_string(),
                        })
                    }
                },
            }
        }
    }

    /// Single admission attempt across all configured scopes.
    ///
    /// A token consumed by an earlier scope is not refunded when a later
    /// scope denies; the denied request retries through every scope.
    pub fn try_acquire(
        &self,
        scopes: &RateScopes,
    ) -> std::result::Result<(), (RateScope, Duration)> {
        let now = Instant::now();

        self.global
            .lock()
            .expect("rate limiter mutex poisoned")
            .try_consume(now)
            .map_err(|wait| (RateScope::Global, wait))?;

        if let (Some(cfg), Some(key)) = (&self.config.per_conversation, &scopes.conversation) {
            let mut bucket = self
                .per_conversation
                .entry(key.clone())
                .or_insert_with(|| TokenBucket::new(cfg));
            bucket.try_consume(now).map_err(|wait| (RateScope::Conversation, wait))?;
        }

        if let (Some(cfg), Some(key)) = (&self.config.per_user, &scopes.user) {
            let mut bucket = self
                .per_user
                .entry(key.clone())
                .or_insert_with(|| TokenBucket::new(cfg));
            bucket.try_consume(now).map_err(|wait| (RateScope::User, wait))?;
        }

        Ok(())
    }

    /// Drop every bucket, refilling all scopes to full on next use.
    pub fn reset(&self) {
        let mut global = self.global.lock().expect("rate limiter mutex poisoned");
        *global = TokenBucket::new(&self.config.global);
        self.per_conversation.clear();
        self.per_user.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbar_core::config::{BucketConfig, RateLimitAction, RateLimitConfig};

    fn limiter(global: BucketConfig, action: RateLimitAction) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            global,
            per_conversation: None,
            per_user: None,
            action,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_capacity_plus_burst_in_one_window() {
        let l = limiter(BucketConfig::new(3, 1_000, 2), RateLimitAction::Reject);
        let scopes = RateScopes::default();
        for _ in 0..5 {
            assert!(l.try_acquire(&scopes).is_ok());
        }
        assert!(l.try_acquire(&scopes).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_capacity_per_window() {
        let l = limiter(BucketConfig::new(2, 1_000, 0), RateLimitAction::Reject);
        let scopes = RateScopes::default();
        assert!(l.try_acquire(&scopes).is_ok());
        assert!(l.try_acquire(&scopes).is_ok());
        assert!(l.try_acquire(&scopes).is_err());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(l.try_acquire(&scopes).is_ok());
        assert!(l.try_acquire(&scopes).is_ok());
        assert!(l.try_acquire(&scopes).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_window_over_capacity() {
        let l = limiter(BucketConfig::new(4, 1_000, 0), RateLimitAction::Reject);
        let scopes = RateScopes::default();
        for _ in 0..4 {
            l.try_acquire(&scopes).unwrap();
        }
        let (scope, wait) = l.try_acquire(&scopes).unwrap_err();
        assert_eq!(scope, RateScope::Global);
        assert_eq!(wait, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_action_resolves_back_to_back_sends() {
        // S2: capacity 1, window 1s, burst 0 — three acquires land at ~0s,
        // ~1s, ~2s.
        let l = limiter(BucketConfig::new(1, 1_000, 0), RateLimitAction::Delay);
        let scopes = RateScopes::default();
        let start = Instant::now();

        l.acquire(&scopes).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));

        l.acquire(&scopes).await.unwrap();
        let second = start.elapsed();
        assert!(second >= Duration::from_millis(950) && second < Duration::from_millis(1_200));

        l.acquire(&scopes).await.unwrap();
        let third = start.elapsed();
        assert!(third >= Duration::from_millis(1_950) && third < Duration::from_millis(2_200));
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_scope_denies_independently() {
        let l = RateLimiter::new(RateLimitConfig {
            global: BucketConfig::new(100, 1_000, 0),
            per_conversation: Some(BucketConfig::new(1, 1_000, 0)),
            per_user: None,
            action: RateLimitAction::Reject,
        });

        let room_a = RateScopes::conversation("slack:T1:C1");
        let room_b = RateScopes::conversation("slack:T1:C2");

        assert!(l.try_acquire(&room_a).is_ok());
        let (scope, _) = l.try_acquire(&room_a).unwrap_err();
        assert_eq!(scope, RateScope::Conversation);
        // A different conversation still has its own bucket.
        assert!(l.try_acquire(&room_b).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_action_signals_caller() {
        let l = limiter(BucketConfig::new(1, 1_000, 0), RateLimitAction::Queue);
        let scopes = RateScopes::default();
        l.acquire(&scopes).await.unwrap();
        let err = l.acquire(&scopes).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitQueued { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_refills_all_buckets() {
        let l = limiter(BucketConfig::new(1, 60_000, 0), RateLimitAction::Reject);
        let scopes = RateScopes::default();
        l.try_acquire(&scopes).unwrap();
        assert!(l.try_acquire(&scopes).is_err());
        l.reset();
        assert!(l.try_acquire(&scopes).is_ok());
    }
}
