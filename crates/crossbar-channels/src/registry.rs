use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::port::ChannelPort;
use crate::types::ConnectionState;

/// Adapters keyed by platform identifier.
///
/// The runtime owns one of these; registration happens before start and
/// the map is read-only afterwards, so lookups need no locking.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ChannelPort>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. An adapter with the same platform identifier
    /// is replaced.
    pub fn register(&mut self, channel: Arc<dyn ChannelPort>) {
        let platform = channel.platform().to_string();
        info!(%platform, "registering channel adapter");
        self.channels.insert(platform, channel);
    }

    pub fn get(&self, platform: &str) -> Option<&Arc<dyn ChannelPort>> {
        self.channels.get(platform)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ChannelPort>)> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Platform identifiers, sorted for deterministic output.
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current connection state per adapter, sorted by platform.
    pub fn connection_states(&self) -> Vec<(String, ConnectionState)> {
        let mut result: Vec<(String, ConnectionState)> = self
            .channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.connection_state()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}
