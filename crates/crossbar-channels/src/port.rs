use async_trait::async_trait;
use tokio::sync::broadcast;

use crossbar_core::{ChannelEvent, ChannelIdentity, ChannelResponse, ConversationKey, GatewayError, Result};

use crate::capabilities::ChannelCapabilities;
use crate::types::{ConnectionState, ConversationInfo, FileInfo, FileUpload, SendResult};

/// Contract every platform adapter satisfies.
///
/// Implementations must be `Send + Sync`: the runtime stores them in a
/// registry and calls `send` concurrently from many pipeline tasks, so
/// `send` takes `&self`.
///
/// Both streams are hot broadcasts: a late subscriber sees nothing
/// historical, and events emitted with no subscriber are dropped. The
/// event stream restarts after `stop`/`start` without replay.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    /// Stable lowercase platform identifier (e.g. `"slack"`). Unique
    /// across registered adapters.
    fn platform(&self) -> &str;

    fn capabilities(&self) -> ChannelCapabilities;

    fn is_running(&self) -> bool;

    /// Subscribe to normalized inbound events.
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Subscribe to transport state changes.
    fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState>;

    /// Snapshot of the current transport state. Adapters built on
    /// [`AdapterCore`](crate::adapter::AdapterCore) report its tracked
    /// state; the default derives one from the running flag.
    fn connection_state(&self) -> ConnectionState {
        if self.is_running() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Connect and begin emitting events. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Disconnect. Idempotent; in-flight sends are cancelled or failed
    /// with `cancelled`.
    async fn stop(&self) -> Result<()>;

    /// Deliver one response to the platform.
    ///
    /// Transport failures surface as `Err` so the policy layer can retry;
    /// an `Ok` result carries the platform's delivery detail.
    async fn send(&self, response: &ChannelResponse) -> Result<SendResult>;

    // Optional operations. Platforms that cannot do these inherit the
    // `unsupported` failure.

    async fn get_identity(&self, user_id: &str) -> Result<ChannelIdentity> {
        let _ = user_id;
        Err(self.unsupported("get_identity"))
    }

    async fn get_conversation(&self, key: &ConversationKey) -> Result<ConversationInfo> {
        let _ = key;
        Err(self.unsupported("get_conversation"))
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<FileInfo> {
        let _ = upload;
        Err(self.unsupported("upload_file"))
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let _ = file_id;
        Err(self.unsupported("download_file"))
    }

    async fn edit_message(
        &self,
        conversation: &ConversationKey,
        message_id: &str,
        text: &str,
    ) -> Result<SendResult> {
        let _ = (conversation, message_id, text);
        Err(self.unsupported("edit_message"))
    }

    async fn delete_message(
        &self,
        conversation: &ConversationKey,
        message_id: &str,
    ) -> Result<()> {
        let _ = (conversation, message_id);
        Err(self.unsupported("delete_message"))
    }

    async fn react(
        &self,
        conversation: &ConversationKey,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let _ = (conversation, message_id, emoji);
        Err(self.unsupported("react"))
    }

    async fn send_typing(&self, conversation: &ConversationKey) -> Result<()> {
        let _ = conversation;
        Err(self.unsupported("send_typing"))
    }

    /// The failure optional operations default to.
    fn unsupported(&self, operation: &str) -> GatewayError {
        GatewayError::Unsupported {
            platform: self.platform().to_string(),
            operation: operation.to_string(),
        }
    }
}
