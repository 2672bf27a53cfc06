use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crossbar_core::{ChannelResponse, ErrorPayload};

/// Processing state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
    Expired,
}

/// Recorded outcome of processing one event, replayed verbatim on
/// duplicate delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Success { response: Option<ChannelResponse> },
    Failure { error: ErrorPayload },
}

impl ProcessOutcome {
    pub fn success(response: Option<ChannelResponse>) -> Self {
        ProcessOutcome::Success { response }
    }

    pub fn failure(error: ErrorPayload) -> Self {
        ProcessOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Success { .. })
    }

    pub fn response(&self) -> Option<&ChannelResponse> {
        match self {
            ProcessOutcome::Success { response } => response.as_ref(),
            ProcessOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorPayload> {
        match self {
            ProcessOutcome::Failure { error } => Some(error),
            ProcessOutcome::Success { .. } => None,
        }
    }
}

/// One lockable record per `event_id`.
///
/// Invariants: `created_at ≤ completed_at ≤ expires_at`; a `processing`
/// record always carries `lock_holder` and `lock_expires_at`; the lock is
/// valid iff `now < lock_expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// Fresh `processing` record owned by `holder`.
    pub fn processing(
        event_id: impl Into<String>,
        holder: impl Into<String>,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            status: IdempotencyStatus::Processing,
            result: None,
            created_at: now,
            completed_at: None,
            expires_at,
            lock_holder: Some(holder.into()),
            lock_expires_at: Some(lock_expires_at),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn lock_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Processing
            && self.lock_expires_at.map_or(false, |at| now < at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::processing(
            "evt-1",
            "instance-a",
            now,
            now + Duration::seconds(300),
            now + Duration::hours(24),
        )
    }

    #[test]
    fn processing_record_carries_lock() {
        let now = Utc::now();
        let r = record(now);
        assert_eq!(r.status, IdempotencyStatus::Processing);
        assert!(r.lock_valid(now));
        assert_eq!(r.lock_holder.as_deref(), Some("instance-a"));
    }

    #[test]
    fn lock_invalid_after_expiry() {
        let now = Utc::now();
        let r = record(now);
        assert!(!r.lock_valid(now + Duration::seconds(301)));
    }

    #[test]
    fn record_expiry_uses_record_ttl() {
        let now = Utc::now();
        let r = record(now);
        assert!(!r.is_expired(now + Duration::hours(23)));
        assert!(r.is_expired(now + Duration::hours(25)));
    }

    #[test]
    fn outcome_json_roundtrip() {
        let outcome = ProcessOutcome::success(None);
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""outcome":"success""#));
        let back: ProcessOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }
}
