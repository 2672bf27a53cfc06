use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crossbar_core::ChannelEvent;

use crate::types::ConnectionState;

/// Broadcast channel depth for events and connection state. Slow
/// subscribers that fall further behind than this lose the oldest
/// entries, per the no-backpressure stream contract.
const STREAM_DEPTH: usize = 256;

/// Reconnection behavior shared by the default adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// State every well-behaved adapter shares: event/state broadcast
/// plumbing, a running flag, and the reconnection counter discipline.
///
/// Concrete adapters embed one of these and wire their transport around
/// it; the runtime only ever talks to the [`ChannelPort`] surface.
///
/// [`ChannelPort`]: crate::port::ChannelPort
pub struct AdapterCore {
    platform: String,
    policy: ReconnectPolicy,
    events_tx: broadcast::Sender<ChannelEvent>,
    state_tx: broadcast::Sender<ConnectionState>,
    state: Mutex<ConnectionState>,
    running: AtomicBool,
    reconnect_attempts: AtomicU32,
}

impl AdapterCore {
    pub fn new(platform: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (events_tx, _) = broadcast::channel(STREAM_DEPTH);
        let (state_tx, _) = broadcast::channel(STREAM_DEPTH);
        Self {
            platform: platform.into(),
            policy,
            events_tx,
            state_tx,
            state: Mutex::new(ConnectionState::Disconnected),
            running: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().expect("adapter state mutex poisoned").clone()
    }

    /// Publish an inbound event. Dropped when no one is subscribed —
    /// streams do not participate in flow control.
    pub fn emit_event(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Update and publish the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock().expect("adapter state mutex poisoned");
            if *current == state {
                return;
            }
            debug!(platform = %self.platform, state = ?state, "connection state change");
            *current = state.clone();
        }
        let _ = self.state_tx.send(state);
    }

    /// Successful connect: reset the reconnect counter.
    pub fn on_connected(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!(platform = %self.platform, "channel connected");
    }

    /// Disconnect or non-fatal transport error.
    ///
    /// Returns the delay before the adapter should retry, or `None` when
    /// reconnection is disabled or exhausted (the state moves to
    /// `failed` in the exhausted case).
    pub fn on_disconnected(&self) -> Option<Duration> {
        if !self.policy.auto_reconnect {
            self.set_state(ConnectionState::Disconnected);
            return None;
        }
        let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if attempts >= self.policy.max_reconnect_attempts {
            warn!(
                platform = %self.platform,
                attempts,
                "reconnect attempts exhausted"
            );
            self.set_state(ConnectionState::Failed);
            return None;
        }
        self.set_state(ConnectionState::Reconnecting);
        debug!(
            platform = %self.platform,
            attempt = attempts + 1,
            delay_ms = self.policy.reconnect_delay.as_millis() as u64,
            "scheduling reconnect"
        );
        Some(self.policy.reconnect_delay)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbar_core::{ChannelIdentity, ConversationKey};

    fn core(policy: ReconnectPolicy) -> AdapterCore {
        AdapterCore::new("slack", policy)
    }

    fn event(id: &str) -> ChannelEvent {
        ChannelEvent::message(
            id,
            ConversationKey::new("slack", "T1", "C1"),
            ChannelIdentity::new("slack", "U1"),
            "hi",
        )
    }

    #[tokio::test]
    async fn events_reach_subscribers_and_late_ones_miss_history() {
        let core = core(ReconnectPolicy::default());
        let mut rx = core.subscribe_events();
        core.emit_event(event("evt-1"));
        assert_eq!(rx.recv().await.unwrap().event_id, "evt-1");

        // A late subscriber does not see evt-1.
        let mut late = core.subscribe_events();
        core.emit_event(event("evt-2"));
        assert_eq!(late.recv().await.unwrap().event_id, "evt-2");
    }

    #[tokio::test]
    async fn emitting_without_subscribers_does_not_panic() {
        let core = core(ReconnectPolicy::default());
        core.emit_event(event("evt-1"));
    }

    #[tokio::test]
    async fn reconnect_counts_and_gives_up() {
        let core = core(ReconnectPolicy {
            auto_reconnect: true,
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
        });

        assert_eq!(core.on_disconnected(), Some(Duration::from_millis(10)));
        assert_eq!(core.connection_state(), ConnectionState::Reconnecting);
        assert_eq!(core.on_disconnected(), Some(Duration::from_millis(10)));
        // Third disconnect exhausts the budget.
        assert_eq!(core.on_disconnected(), None);
        assert_eq!(core.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn connect_resets_the_counter() {
        let core = core(ReconnectPolicy {
            auto_reconnect: true,
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
        });
        core.on_disconnected();
        core.on_connected();
        assert_eq!(core.reconnect_attempts(), 0);
        assert_eq!(core.connection_state(), ConnectionState::Connected);
        // Full budget available again.
        assert!(core.on_disconnected().is_some());
        assert!(core.on_disconnected().is_some());
    }

    #[tokio::test]
    async fn auto_reconnect_off_goes_straight_to_disconnected() {
        let core = core(ReconnectPolicy {
            auto_reconnect: false,
            ..ReconnectPolicy::default()
        });
        assert_eq!(core.on_disconnected(), None);
        assert_eq!(core.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn state_changes_are_broadcast_once() {
        let core = core(ReconnectPolicy::default());
        let mut rx = core.subscribe_state();
        core.set_state(ConnectionState::Connecting);
        core.set_state(ConnectionState::Connecting); // duplicate, suppressed
        core.set_state(ConnectionState::Connected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
    }
}
