use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

use crossbar_core::config::SessionStoreConfig;
use crossbar_core::{ConversationKey, Result};

use crate::types::{Session, SessionState};

/// Indexed session persistence contract.
///
/// Lookup is by session id, by conversation key, and by `(platform,
/// user)`. Durable backends plug in behind this trait; the in-memory
/// store is the reference implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>>;

    async fn get_by_conversation(&self, key: &ConversationKey) -> Result<Option<Session>>;

    /// Every session whose principal is the given platform user, most
    /// recently active first.
    async fn get_by_user(&self, platform: &str, user_id: &str) -> Result<Vec<Session>>;

    /// Insert or overwrite. The write is whole-value: callers mutate a
    /// copy and save it back.
    async fn save(&self, session: Session) -> Result<()>;

    /// Remove a session; returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Sessions sorted by `last_activity_at` descending, paginated, with
    /// an optional state filter.
    async fn list(
        &self,
        offset: usize,
        limit: usize,
        state: Option<SessionState>,
    ) -> Result<Vec<Session>>;

    /// Remove every expired session, returning how many were dropped.
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// Reference store: three concurrent indexes over owned session values.
pub struct InMemorySessionStore {
    config: SessionStoreConfig,
    sessions: DashMap<String, Session>,
    by_conversation: DashMap<String, String>,
    by_user: DashMap<String, HashSet<String>>,
}

impl InMemorySessionStore {
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            by_conversation: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    fn user_key(platform: &str, user_id: &str) -> String {
        format!("{platform}:{user_id}")
    }

    fn unindex(&self, session: &Session) {
        let conv_key = session.conversation.format();
        // Only drop the conversation index if it still points at this
        // session; a newer session may have taken the slot.
        if let Some(entry) = self.by_conversation.get(&conv_key) {
            if *entry == session.id {
                drop(entry);
                self.by_conversation.remove(&conv_key);
            }
        }
        let user_key = Self::user_key(
            &session.principal.identity.platform,
            &session.principal.identity.id,
        );
        if let Some(mut ids) = self.by_user.get_mut(&user_key) {
            ids.remove(&session.id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    async fn get_by_conversation(&self, key: &ConversationKey) -> Result<Option<Session>> {
        let Some(id) = self
            .by_conversation
            .get(&key.format())
            .map(|e| e.value().clone())
        else {
            return Ok(None);
        };
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    async fn get_by_user(&self, platform: &str, user_id: &str) -> Result<Vec<Session>> {
        let Some(ids) = self
            .by_user
            .get(&Self::user_key(platform, user_id))
            .map(|e| e.value().clone())
        else {
            return Ok(Vec::new());
        };
        let mut sessions: Vec<Session> = ids
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.value().clone()))
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn save(&self, session: Session) -> Result<()> {
        // Trimming is the manager's job; the store asserts the invariant
        // held at the write boundary.
        debug_assert!(
            session.history.len() <= self.config.max_history_size,
            "session history exceeds max_history_size at save"
        );

        self.by_conversation
            .insert(session.conversation.format(), session.id.clone());
        let user_key = Self::user_key(
            &session.principal.identity.platform,
            &session.principal.identity.id,
        );
        self.by_user
            .entry(user_key)
            .or_default()
            .insert(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(false);
        };
        self.unindex(&session);
        Ok(true)
    }

    async fn list(
        &self,
        offset: usize,
        limit: usize,
        state: Option<SessionState>,
    ) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .filter(|s| state.map_or(true, |wanted| s.state == wanted))
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            if let Some((_, session)) = self.sessions.remove(id) {
                self.unindex(&session);
            }
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "session cleanup removed expired sessions");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crossbar_core::{ChannelIdentity, Principal};

    fn store() -> InMemorySessionStore {
        InMemorySessionStore::new(SessionStoreConfig::default())
    }

    fn session_for(room: &str, user: &str) -> Session {
        Session::new(
            ConversationKey::new("slack", "T1", room),
            Principal::new(ChannelIdentity::new("slack", user), "T1"),
            Some(Duration::hours(24)),
        )
    }

    #[tokio::test]
    async fn all_three_indexes_resolve() {
        let store = store();
        let s = session_for("C1", "U1");
        let id = s.id.clone();
        store.save(s.clone()).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap().unwrap().id, id);
        assert_eq!(
            store
                .get_by_conversation(&s.conversation)
                .await
                .unwrap()
                .unwrap()
                .id,
            id
        );
        let by_user = store.get_by_user("slack", "U1").await.unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].id, id);
    }

    #[tokio::test]
    async fn unknown_id_reads_as_none() {
        assert!(store().get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newer_session_takes_the_conversation_slot() {
        let store = store();
        let old = session_for("C1", "U1");
        store.save(old.clone()).await.unwrap();
        let new = session_for("C1", "U1");
        store.save(new.clone()).await.unwrap();

        let resolved = store
            .get_by_conversation(&new.conversation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, new.id);

        // Deleting the superseded session must not drop the index entry
        // now owned by the newer one.
        store.delete(&old.id).await.unwrap();
        assert!(store
            .get_by_conversation(&new.conversation)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn list_orders_by_recent_activity_and_paginates() {
        let store = store();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut s = session_for(&format!("C{i}"), "U1");
            s.last_activity_at = Utc::now() + Duration::seconds(i);
            ids.push(s.id.clone());
            store.save(s).await.unwrap();
        }

        let page = store.list(0, 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[4]);
        assert_eq!(page[1].id, ids[3]);

        let rest = store.list(2, 10, None).await.unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let store = store();
        let mut paused = session_for("C1", "U1");
        paused.state = SessionState::Paused;
        store.save(paused).await.unwrap();
        store.save(session_for("C2", "U1")).await.unwrap();

        let active = store.list(0, 10, Some(SessionState::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, SessionState::Active);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_and_their_indexes() {
        let store = store();
        let mut dead = session_for("C1", "U1");
        dead.expires_at = Some(Utc::now() - Duration::seconds(1));
        let dead_conv = dead.conversation.clone();
        store.save(dead).await.unwrap();
        store.save(session_for("C2", "U2")).await.unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store
            .get_by_conversation(&dead_conv)
            .await
            .unwrap()
            .is_none());
        assert!(store.get_by_user("slack", "U1").await.unwrap().is_empty());
    }
}
