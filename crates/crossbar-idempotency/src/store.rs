use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crossbar_core::{ErrorPayload, GatewayError, Result};

use crate::record::{IdempotencyRecord, IdempotencyStatus, ProcessOutcome};

/// Keyed idempotency records with a lock discipline safe for
/// multi-instance deployments.
///
/// `try_acquire` must be atomic against concurrent callers: in-memory via
/// a mutex, distributed via the backend's compare-and-set.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the record for `event_id`. Records past `expires_at` read as
    /// absent.
    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>>;

    /// Atomically claim `event_id` for `holder`, writing a fresh
    /// `processing` record.
    ///
    /// Succeeds when there is no live record: none at all, an expired one,
    /// a `processing` record whose lock has lapsed, or a `failed` record
    /// (the guard only re-acquires those when `retry_failed` allows it).
    /// Returns false when another holder's claim stands.
    async fn try_acquire(
        &self,
        event_id: &str,
        holder: &str,
        lock_ttl: Duration,
        record_ttl: Duration,
    ) -> Result<bool>;

    /// Transition to `completed` with the outcome attached, clearing the
    /// lock. `created_at` and `expires_at` are preserved.
    async fn complete(&self, event_id: &str, result: ProcessOutcome) -> Result<()>;

    /// Transition to `failed` with the failure recorded. Same preservation
    /// as `complete`.
    async fn fail(&self, event_id: &str, error: ErrorPayload) -> Result<()>;

    /// Delete the record, abandoning the lock without recording an
    /// outcome.
    async fn release(&self, event_id: &str) -> Result<()>;

    /// Remove every expired record, returning how many were dropped.
    async fn cleanup(&self) -> Result<usize>;
}

/// Reference store: one mutex over a `HashMap`, which makes every
/// operation — `try_acquire` in particular — atomic.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/ops hook: number of live records.
    pub fn len(&self) -> usize {
        self.records.lock().expect("idempotency mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, event_id: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        let records = self.records.lock().expect("idempotency mutex poisoned");
        Ok(records
            .get(event_id)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn try_acquire(
        &self,
        event_id: &str,
        holder: &str,
        lock_ttl: Duration,
        record_ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut records = self.records.lock().expect("idempotency mutex poisoned");

        if let Some(existing) = records.get(event_id) {
            let reacquirable = existing.is_expired(now)
                || existing.status == IdempotencyStatus::Failed
                || (existing.status == IdempotencyStatus::Processing
                    && !existing.lock_valid(now));
            if !reacquirable {
                return Ok(false);
            }
        }

        let lock_expires_at = now
            + ChronoDuration::from_std(lock_ttl)
                .map_err(|e| GatewayError::InvalidRequest(format!("lock ttl: {e}")))?;
        let expires_at = now
            + ChronoDuration::from_std(record_ttl)
                .map_err(|e| GatewayError::InvalidRequest(format!("record ttl: {e}")))?;

        records.insert(
            event_id.to_string(),
            IdempotencyRecord::processing(event_id, holder, now, lock_expires_at, expires_at),
        );
        Ok(true)
    }

    async fn complete(&self, event_id: &str, result: ProcessOutcome) -> Result<()> {
        let mut records = self.records.lock().expect("idempotency mutex poisoned");
        let record = records
            .get_mut(event_id)
            .ok_or_else(|| GatewayError::NotFound(format!("idempotency record {event_id}")))?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.completed_at = Some(Utc::now());
        record.lock_holder = None;
        record.lock_expires_at = None;
        Ok(())
    }

    async fn fail(&self, event_id: &str, error: ErrorPayload) -> Result<()> {
        let mut records = self.records.lock().expect("idempotency mutex poisoned");
        let record = records
            .get_mut(event_id)
            .ok_or_else(|| GatewayError::NotFound(format!("idempotency record {event_id}")))?;
        record.status = IdempotencyStatus::Failed;
        record.result = Some(ProcessOutcome::failure(error));
        record.completed_at = Some(Utc::now());
        record.lock_holder = None;
        record.lock_expires_at = None;
        Ok(())
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let mut records = self.records.lock().expect("idempotency mutex poisoned");
        records.remove(event_id);
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize> {
        let now = Utc::now();
        let mut records = self.records.lock().expect("idempotency mutex poisoned");
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "idempotency cleanup removed expired records");
        }
        Ok(removed)
    }
}
