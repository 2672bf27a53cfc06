use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crossbar_core::config::IdempotencyConfig;
use crossbar_core::{ChannelResponse, GatewayError, Result};

use crate::record::{IdempotencyStatus, ProcessOutcome};
use crate::store::IdempotencyStore;

/// Exactly-once wrapper around a processor.
///
/// `process` is the single entry point: it resolves duplicates from the
/// store, claims the event for this instance, runs the closure, and
/// records the outcome. Processor failures become `failed` records and a
/// failure outcome — nothing is rethrown above the guard.
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    /// Lock-holder identity of this runtime instance.
    instance_id: String,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Process `event_id` exactly once across all instances.
    ///
    /// Duplicates of a completed event get the cached outcome; a valid
    /// concurrent lock yields an `already_processing` failure without
    /// waiting.
    #[instrument(skip(self, op), fields(instance = %self.instance_id))]
    pub async fn process<F, Fut>(&self, event_id: &str, op: F) -> Result<ProcessOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<ChannelResponse>>>,
    {
        let now = Utc::now();
        if let Some(existing) = self.store.get(event_id).await? {
            match existing.status {
                IdempotencyStatus::Completed => {
                    debug!("duplicate delivery, returning cached result");
                    return Ok(existing
                        .result
                        .unwrap_or(ProcessOutcome::Success { response: None }));
                }
                IdempotencyStatus::Failed if !self.config.retry_failed => {
                    debug!("duplicate delivery of failed event, echoing failure");
                    let error = existing
                        .result
                        .as_ref()
                        .and_then(|r| r.error().cloned())
                        .unwrap_or_else(|| {
                            GatewayError::Unknown("prior processing failed".into()).to_payload()
                        });
                    return Ok(ProcessOutcome::failure(error));
                }
                IdempotencyStatus::Processing if existing.lock_valid(now) => {
                    warn!(
                        holder = existing.lock_holder.as_deref().unwrap_or("?"),
                        "event is locked by another instance"
                    );
                    return Ok(ProcessOutcome::failure(
                        GatewayError::AlreadyProcessing {
                            event_id: event_id.to_string(),
                        }
                        .to_payload(),
                    ));
                }
                // Failed with retry_failed, expired, or a lapsed lock:
                // fall through to re-acquisition.
                _ => {}
            }
        }

        let acquired = self
            .store
            .try_acquire(
                event_id,
                &self.instance_id,
                self.config.lock_timeout(),
                self.config.record_ttl(),
            )
            .await?;
        if !acquired {
            // A concurrent instance won the race between get and acquire.
            return Ok(ProcessOutcome::failure(
                GatewayError::AlreadyProcessing {
                    event_id: event_id.to_string(),
                }
                .to_payload(),
            ));
        }

        match op().await {
            Ok(response) => {
                let outcome = ProcessOutcome::success(response);
                self.store.complete(event_id, outcome.clone()).await?;
                Ok(outcome)
            }
            Err(err) => {
                let payload = err.to_payload();
                self.store.fail(event_id, payload.clone()).await?;
                Ok(ProcessOutcome::failure(payload))
            }
        }
    }

    /// Spawn the periodic expired-record sweep. The task runs until the
    /// token is cancelled.
    pub fn start_cleanup_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.cleanup().await {
                            error!(error = %e, "idempotency cleanup failed");
                        }
                    }
                }
            }
        })
    }
}
