use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crossbar_core::config::SessionStoreConfig;
use crossbar_core::{ChannelEvent, ConversationKey, GatewayError, Principal, Result};

use crate::store::SessionStore;
use crate::types::{Session, SessionMessage, SessionState};

/// Copy-on-write facade over the session store.
///
/// Every mutator loads the current value, derives the update, and writes
/// it back, so no shared mutable session state escapes the manager.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    config: SessionStoreConfig,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionStoreConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Return the live session for the event's conversation, or create
    /// one. A terminal (closed/expired) session is replaced with a fresh
    /// one — `expired` never resurrects.
    #[instrument(skip(self, event), fields(conversation = %event.conversation))]
    pub async fn get_or_create_session(&self, event: &ChannelEvent) -> Result<Session> {
        let now = Utc::now();
        if let Some(session) = self.store.get_by_conversation(&event.conversation).await? {
            let terminal = matches!(session.state, SessionState::Closed | SessionState::Expired)
                || session.is_expired(now);
            if !terminal {
                debug!(session_id = %session.id, "session cache hit");
                return self.touch(&session.id).await;
            }
        }

        let principal = Principal::new(event.sender.clone(), event.conversation.tenant.clone());
        self.create_session(event.conversation.clone(), principal)
            .await
    }

    /// Create and persist a fresh active session.
    pub async fn create_session(
        &self,
        conversation: ConversationKey,
        principal: Principal,
    ) -> Result<Session> {
        let ttl = ChronoDuration::seconds(self.config.default_timeout_secs as i64);
        let session = Session::new(conversation, principal, Some(ttl));
        debug!(session_id = %session.id, "created session");
        self.store.save(session.clone()).await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.store.get(id).await
    }

    pub async fn get_session_by_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Session>> {
        self.store.get_by_conversation(key).await
    }

    /// Every session belonging to a platform user, most recent first.
    pub async fn get_sessions_by_user(
        &self,
        platform: &str,
        user_id: &str,
    ) -> Result<Vec<Session>> {
        self.store.get_by_user(platform, user_id).await
    }

    /// Append a message, trimming history FIFO to `max_history_size`.
    #[instrument(skip(self, message), fields(session_id = id))]
    pub async fn add_message(&self, id: &str, message: SessionMessage) -> Result<Session> {
        self.mutate(id, |session| {
            session.history.push(message);
            let max = self.config.max_history_size;
            if session.history.len() > max {
                let excess = session.history.len() - max;
                session.history.drain(..excess);
            }
            Ok(())
        })
        .await
    }

    /// Merge `updates` into the session context.
    pub async fn update_context(
        &self,
        id: &str,
        updates: HashMap<String, serde_json::Value>,
    ) -> Result<Session> {
        self.mutate(id, |session| {
            session.context.extend(updates);
            Ok(())
        })
        .await
    }

    pub async fn set_context_value(
        &self,
        id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Session> {
        let key = key.into();
        self.mutate(id, |session| {
            session.context.insert(key, value);
            Ok(())
        })
        .await
    }

    pub async fn remove_context_value(&self, id: &str, key: &str) -> Result<Session> {
        self.mutate(id, |session| {
            session.context.remove(key);
            Ok(())
        })
        .await
    }

    pub async fn clear_context(&self, id: &str) -> Result<Session> {
        self.mutate(id, |session| {
            session.context.clear();
            Ok(())
        })
        .await
    }

    /// Refresh activity and push the expiry deadline out by the default
    /// timeout.
    pub async fn touch(&self, id: &str) -> Result<Session> {
        let ttl = ChronoDuration::seconds(self.config.default_timeout_secs as i64);
        self.mutate(id, |session| {
            session.expires_at = Some(Utc::now() + ttl);
            Ok(())
        })
        .await
    }

    pub async fn pause(&self, id: &str) -> Result<Session> {
        self.transition(id, SessionState::Paused, &[SessionState::Active])
            .await
    }

    pub async fn resume(&self, id: &str) -> Result<Session> {
        self.transition(id, SessionState::Active, &[SessionState::Paused])
            .await
    }

    pub async fn close(&self, id: &str) -> Result<Session> {
        self.transition(
            id,
            SessionState::Closed,
            &[SessionState::Active, SessionState::Paused],
        )
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.store.delete(id).await? {
            return Err(GatewayError::SessionNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn list(
        &self,
        offset: usize,
        limit: usize,
        state: Option<SessionState>,
    ) -> Result<Vec<Session>> {
        self.store.list(offset, limit, state).await
    }

    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.store.cleanup_expired().await
    }

    /// Spawn the periodic expired-session sweep. Runs until cancelled.
    pub fn start_cleanup_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.cleanup_expired().await {
                            error!(error = %e, "session cleanup failed");
                        }
                    }
                }
            }
        })
    }

    /// Load → apply → stamp activity → save. The common copy-on-write
    /// path shared by every mutator.
    async fn mutate<F>(&self, id: &str, apply: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound { id: id.to_string() })?;
        apply(&mut session)?;
        session.last_activity_at = Utc::now();
        self.store.save(session.clone()).await?;
        Ok(session)
    }

    async fn transition(
        &self,
        id: &str,
        to: SessionState,
        allowed_from: &[SessionState],
    ) -> Result<Session> {
        self.mutate(id, |session| {
            if !allowed_from.contains(&session.state) {
                return Err(GatewayError::InvalidRequest(format!(
                    "cannot move session {id} from {:?} to {to:?}",
                    session.state
                )));
            }
            session.state = to;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;
    use crossbar_core::{ChannelIdentity, ErrorCode};

    fn manager(max_history: usize) -> SessionManager {
        let config = SessionStoreConfig {
            max_history_size: max_history,
            ..SessionStoreConfig::default()
        };
        let store = Arc::new(InMemorySessionStore::new(config.clone()));
        SessionManager::new(store, config)
    }

    fn event(room: &str) -> ChannelEvent {
        ChannelEvent::message(
            format!("evt-{room}"),
            ConversationKey::new("slack", "T1", room),
            ChannelIdentity::new("slack", "U1"),
            "hello",
        )
    }

    #[tokio::test]
    async fn get_or_create_is_an_upsert() {
        let mgr = manager(100);
        let first = mgr.get_or_create_session(&event("C1")).await.unwrap();
        let second = mgr.get_or_create_session(&event("C1")).await.unwrap();
        assert_eq!(first.id, second.id);

        let other = mgr.get_or_create_session(&event("C2")).await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn terminal_sessions_are_replaced_not_resurrected() {
        let mgr = manager(100);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();
        mgr.close(&s.id).await.unwrap();

        let replacement = mgr.get_or_create_session(&event("C1")).await.unwrap();
        assert_ne!(replacement.id, s.id);
        assert_eq!(replacement.state, SessionState::Active);
        // The closed session is untouched.
        assert_eq!(
            mgr.get_session(&s.id).await.unwrap().unwrap().state,
            SessionState::Closed
        );
    }

    #[tokio::test]
    async fn history_trims_fifo_to_max() {
        // S5: max 5, append 10 — the last five remain in append order.
        let mgr = manager(5);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();
        for i in 1..=10 {
            mgr.add_message(&s.id, SessionMessage::user(format!("m{i}"), format!("e{i}")))
                .await
                .unwrap();
        }
        let s = mgr.get_session(&s.id).await.unwrap().unwrap();
        let contents: Vec<&str> = s.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m6", "m7", "m8", "m9", "m10"]);
    }

    #[tokio::test]
    async fn history_shorter_than_max_is_untrimmed() {
        let mgr = manager(5);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();
        for i in 1..=3 {
            mgr.add_message(&s.id, SessionMessage::user(format!("m{i}"), format!("e{i}")))
                .await
                .unwrap();
        }
        let s = mgr.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(s.history.len(), 3);
    }

    #[tokio::test]
    async fn mutators_on_unknown_session_fail_recoverably() {
        let mgr = manager(100);
        let err = mgr
            .add_message("nope", SessionMessage::assistant("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert!(mgr.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pause_resume_close_state_machine() {
        let mgr = manager(100);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();

        let paused = mgr.pause(&s.id).await.unwrap();
        assert_eq!(paused.state, SessionState::Paused);

        // Pausing a paused session is an invalid transition.
        assert!(mgr.pause(&s.id).await.is_err());

        let resumed = mgr.resume(&s.id).await.unwrap();
        assert_eq!(resumed.state, SessionState::Active);

        let closed = mgr.close(&s.id).await.unwrap();
        assert_eq!(closed.state, SessionState::Closed);

        // Closed is terminal.
        assert!(mgr.resume(&s.id).await.is_err());
        assert!(mgr.pause(&s.id).await.is_err());
    }

    #[tokio::test]
    async fn context_operations() {
        let mgr = manager(100);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();

        mgr.set_context_value(&s.id, "lang", serde_json::json!("en"))
            .await
            .unwrap();
        let mut updates = HashMap::new();
        updates.insert("mode".to_string(), serde_json::json!("fast"));
        let s2 = mgr.update_context(&s.id, updates).await.unwrap();
        assert_eq!(s2.context.len(), 2);

        let s3 = mgr.remove_context_value(&s.id, "lang").await.unwrap();
        assert!(!s3.context.contains_key("lang"));

        let s4 = mgr.clear_context(&s.id).await.unwrap();
        assert!(s4.context.is_empty());
    }

    #[tokio::test]
    async fn touch_extends_expiry_and_bumps_activity() {
        let mgr = manager(100);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();
        let touched = mgr.touch(&s.id).await.unwrap();
        assert!(touched.expires_at.unwrap() >= s.expires_at.unwrap());
        assert!(touched.last_activity_at >= s.last_activity_at);
    }

    #[tokio::test]
    async fn delete_then_lookup_fails() {
        let mgr = manager(100);
        let s = mgr.get_or_create_session(&event("C1")).await.unwrap();
        mgr.delete(&s.id).await.unwrap();
        let err = mgr.delete(&s.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
    }
}
