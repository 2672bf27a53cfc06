use async_trait::async_trait;

use crossbar_core::{ChannelEvent, ChannelResponse, Result};
use crossbar_sessions::Session;

/// What a [`MessageProcessor`] decided about an event.
///
/// Exhaustive matching at every dispatch site: adding a variant is a
/// compile-time obligation for all of them.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Send this response to the originating conversation.
    Respond(ChannelResponse),
    /// Run the named tool, then respond with its formatted result.
    NeedsTool {
        name: String,
        arguments: serde_json::Value,
    },
    /// Not handled here — fall through to the configured dispatch mode.
    Defer,
    /// Consume the event without responding.
    Ignore,
}

/// First-look hook over the dispatch modes.
///
/// When configured, the runtime consults the processor before mode
/// dispatch; `Defer` hands the event on to the `llm`/`direct_tool`
/// pipeline.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, event: &ChannelEvent, session: &Session) -> Result<ProcessResult>;
}
