use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::ErrorCode;

/// Top-level config (crossbar.toml + CROSSBAR_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrossbarConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub sessions: SessionStoreConfig,
    /// Policy applied to platforms without a dedicated entry below.
    #[serde(default)]
    pub policy: ChannelPolicy,
    /// Per-platform policy overrides, keyed by platform identifier.
    #[serde(default)]
    pub platform_policies: HashMap<String, ChannelPolicy>,
}

impl CrossbarConfig {
    /// Load config from a TOML file with CROSSBAR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.crossbar/crossbar.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CrossbarConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CROSSBAR_").split("_"))
            .extract()
            .map_err(|e| crate::error::GatewayError::InvalidRequest(e.to_string()))?;

        Ok(config)
    }

    /// Resolve the policy for a platform, falling back to the default.
    pub fn policy_for(&self, platform: &str) -> &ChannelPolicy {
        self.platform_policies.get(platform).unwrap_or(&self.policy)
    }
}

/// How the runtime dispatches the inner processor for each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Invoke the configured response generator (LM bridge) with tool
    /// roundtrips.
    #[default]
    Llm,
    /// Parse the event text as `<tool> <args…>` and invoke the tool
    /// provider directly.
    DirectTool,
    /// Produce no response; the embedding application handles the event.
    Custom,
}

/// Runtime orchestrator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub default_mode: DispatchMode,
    /// How long `stop()` waits for in-flight pipelines to drain.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_mode: DispatchMode::default(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Exactly-once processing guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a completed/failed record is kept for dedupe (default 24h).
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
    /// How long a processing lock is honored before another instance may
    /// steal it (default 5m).
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// When true, a previously failed event is re-processed on redelivery
    /// instead of replaying the failure.
    #[serde(default)]
    pub retry_failed: bool,
    /// Cadence of the expired-record sweep (default 1h).
    #[serde(default = "default_idem_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: default_record_ttl_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            retry_failed: false,
            cleanup_interval_secs: default_idem_cleanup_secs(),
        }
    }
}

impl IdempotencyConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Session store and manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// Idle lifetime granted to a session on each touch (default 24h).
    #[serde(default = "default_session_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Maximum retained history entries per session (default 100).
    #[serde(default = "default_max_history")]
    pub max_history_size: usize,
    /// Cadence of the expired-session sweep (default 15m).
    #[serde(default = "default_session_cleanup_secs")]
    pub cleanup_interval_secs: u64,
    /// Reserved for durable store backends; the in-memory store ignores it.
    #[serde(default)]
    pub persistent: bool,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_session_timeout_secs(),
            max_history_size: default_max_history(),
            cleanup_interval_secs: default_session_cleanup_secs(),
            persistent: false,
        }
    }
}

impl SessionStoreConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// One token bucket: `capacity` tokens refill per `refill_window_ms`, with
/// up to `burst` extra tokens held briefly above capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_window_ms: u64,
    #[serde(default)]
    pub burst: u32,
}

impl BucketConfig {
    pub fn new(capacity: u32, refill_window_ms: u64, burst: u32) -> Self {
        Self {
            capacity,
            refill_window_ms,
            burst,
        }
    }

    pub fn refill_window(&self) -> Duration {
        Duration::from_millis(self.refill_window_ms)
    }
}

/// What the limiter does when a bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    /// Sleep for the retry-after hint and try again within the same call.
    #[default]
    Delay,
    /// Fail immediately with `rate_limited`.
    Reject,
    /// Fail with a queuing signal; durable queuing is the caller's job.
    Queue,
}

/// Multi-scope admission control: global, then per-conversation, then
/// per-user. Denial short-circuits at the first failing scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub global: BucketConfig,
    #[serde(default)]
    pub per_conversation: Option<BucketConfig>,
    #[serde(default)]
    pub per_user: Option<BucketConfig>,
    #[serde(default)]
    pub action: RateLimitAction,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig::new(60, 60_000, 10),
            per_conversation: Some(BucketConfig::new(1, 1_000, 1)),
            per_user: None,
            action: RateLimitAction::Delay,
        }
    }
}

/// Backoff schedule between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
    Linear {
        initial_ms: u64,
        step_ms: u64,
        max_ms: u64,
    },
    Fixed {
        delay_ms: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            initial_ms: 500,
            max_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Bounded retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Uniform jitter fraction in [0, 1] applied to each backoff delay.
    #[serde(default)]
    pub jitter: f64,
    /// Error codes retried in addition to the codes the taxonomy marks
    /// retryable.
    #[serde(default)]
    pub retryable_error_codes: Vec<ErrorCode>,
    /// Hard wall-clock cap across all attempts and waits.
    #[serde(default)]
    pub max_total_duration_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            jitter: 0.2,
            retryable_error_codes: Vec::new(),
            max_total_duration_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn max_total_duration(&self) -> Option<Duration> {
        self.max_total_duration_ms.map(Duration::from_millis)
    }
}

/// Failure-rate tripping with half-open probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling window in which failures are counted.
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    /// How long the circuit stays open before admitting a probe.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Consecutive half-open successes required to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Error codes that count toward the failure threshold.
    #[serde(default = "default_trigger_errors")]
    pub trigger_errors: Vec<ErrorCode>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
            trigger_errors: default_trigger_errors(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Named wall-clock deadline classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    Connection,
    Request,
    /// Bounds the whole policy execution including retries and waits.
    Operation,
    Idle,
}

impl fmt::Display for TimeoutClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutClass::Connection => "connection",
            TimeoutClass::Request => "request",
            TimeoutClass::Operation => "operation",
            TimeoutClass::Idle => "idle",
        };
        f.write_str(s)
    }
}

/// Per-class timeout durations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_ms: default_connection_timeout_ms(),
            request_ms: default_request_timeout_ms(),
            operation_ms: default_operation_timeout_ms(),
            idle_ms: default_idle_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn duration(&self, class: TimeoutClass) -> Duration {
        let ms = match class {
            TimeoutClass::Connection => self.connection_ms,
            TimeoutClass::Request => self.request_ms,
            TimeoutClass::Operation => self.operation_ms,
            TimeoutClass::Idle => self.idle_ms,
        };
        Duration::from_millis(ms)
    }
}

/// The resilience policy applied around every outbound operation:
/// rate limit, retry, circuit breaker, and timeouts as one tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelPolicy {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

impl ChannelPolicy {
    /// Slack tolerates ~1 message/sec/channel; workspace-wide web API
    /// limits sit around tier 3 (50+/min).
    pub fn slack() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                global: BucketConfig::new(50, 60_000, 10),
                per_conversation: Some(BucketConfig::new(1, 1_000, 1)),
                per_user: None,
                action: RateLimitAction::Delay,
            },
            retry: RetryConfig {
                max_attempts: 3,
                backoff: BackoffConfig::Exponential {
                    initial_ms: 1_000,
                    max_ms: 30_000,
                    multiplier: 2.0,
                },
                jitter: 0.2,
                ..RetryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Discord's REST surface allows ~50 req/sec globally with per-route
    /// buckets; 5 messages per 5s per channel is the practical limit.
    pub fn discord() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                global: BucketConfig::new(50, 1_000, 0),
                per_conversation: Some(BucketConfig::new(5, 5_000, 0)),
                per_user: None,
                action: RateLimitAction::Delay,
            },
            retry: RetryConfig {
                max_attempts: 4,
                backoff: BackoffConfig::Exponential {
                    initial_ms: 500,
                    max_ms: 15_000,
                    multiplier: 2.0,
                },
                jitter: 0.25,
                ..RetryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Telegram caps bots at ~30 messages/sec overall and 1/sec per chat.
    pub fn telegram() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                global: BucketConfig::new(30, 1_000, 0),
                per_conversation: Some(BucketConfig::new(1, 1_000, 1)),
                per_user: None,
                action: RateLimitAction::Delay,
            },
            ..Self::default()
        }
    }

    /// Teams is the most conservative: roughly 4 req/sec per app with
    /// aggressive 429s, so retries back off further.
    pub fn teams() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                global: BucketConfig::new(4, 1_000, 2),
                per_conversation: Some(BucketConfig::new(1, 1_000, 0)),
                per_user: None,
                action: RateLimitAction::Delay,
            },
            retry: RetryConfig {
                max_attempts: 5,
                backoff: BackoffConfig::Exponential {
                    initial_ms: 2_000,
                    max_ms: 60_000,
                    multiplier: 2.0,
                },
                jitter: 0.3,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                ..CircuitBreakerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Look up the preset for a platform identifier, if one ships.
    pub fn preset(platform: &str) -> Option<Self> {
        match platform {
            "slack" => Some(Self::slack()),
            "discord" => Some(Self::discord()),
            "telegram" => Some(Self::telegram()),
            "teams" => Some(Self::teams()),
            _ => None,
        }
    }
}

fn default_config_path() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/.crossbar/crossbar.toml"))
        .unwrap_or_else(|_| ".crossbar/crossbar.toml".to_string())
}

fn default_drain_grace_ms() -> u64 {
    5_000
}
fn default_record_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_lock_timeout_secs() -> u64 {
    5 * 60
}
fn default_idem_cleanup_secs() -> u64 {
    60 * 60
}
fn default_session_timeout_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_history() -> usize {
    100
}
fn default_session_cleanup_secs() -> u64 {
    15 * 60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_ms() -> u64 {
    60_000
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    2
}
fn default_trigger_errors() -> Vec<ErrorCode> {
    vec![
        ErrorCode::NetworkError,
        ErrorCode::Timeout,
        ErrorCode::ServerError,
    ]
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_operation_timeout_ms() -> u64 {
    120_000
}
fn default_idle_timeout_ms() -> u64 {
    300_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CrossbarConfig::default();
        assert_eq!(cfg.idempotency.record_ttl_secs, 86_400);
        assert_eq!(cfg.idempotency.lock_timeout_secs, 300);
        assert!(!cfg.idempotency.retry_failed);
        assert_eq!(cfg.sessions.max_history_size, 100);
        assert_eq!(cfg.sessions.cleanup_interval_secs, 900);
    }

    #[test]
    fn policy_for_falls_back_to_default() {
        let mut cfg = CrossbarConfig::default();
        cfg.platform_policies
            .insert("teams".to_string(), ChannelPolicy::teams());
        assert_eq!(cfg.policy_for("teams").rate_limit.global.capacity, 4);
        assert_eq!(
            cfg.policy_for("slack").rate_limit.global.capacity,
            cfg.policy.rate_limit.global.capacity
        );
    }

    #[test]
    fn presets_cover_shipped_platforms() {
        for platform in ["slack", "discord", "telegram", "teams"] {
            assert!(ChannelPolicy::preset(platform).is_some(), "{platform}");
        }
        assert!(ChannelPolicy::preset("irc").is_none());
    }

    #[test]
    fn breaker_trigger_errors_default() {
        let cfg = CircuitBreakerConfig::default();
        assert_eq!(
            cfg.trigger_errors,
            vec![
                ErrorCode::NetworkError,
                ErrorCode::Timeout,
                ErrorCode::ServerError
            ]
        );
    }

    #[test]
    fn policy_serde_roundtrip() {
        let policy = ChannelPolicy::slack();
        let json = serde_json::to_string(&policy).unwrap();
        let back: ChannelPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
