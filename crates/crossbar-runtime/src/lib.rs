//! The runtime orchestrator: demultiplexes events from every connected
//! adapter and drives each through idempotency → policy → processor →
//! response emission, with lifecycle management and observable streams.
//!
//! Extension points live here too: [`MessageProcessor`] for first-look
//! handling, [`ResponseGenerator`] for the language-model bridge, and
//! [`ToolProvider`] for tool execution. The core consumes these
//! contracts; it never implements a backend.

pub mod generate;
pub mod processor;
pub mod runtime;
pub mod tools;

pub use generate::{ReplyChunk, ReplyStream, ResponseGenerator};
pub use processor::{MessageProcessor, ProcessResult};
pub use runtime::{ChannelRuntime, ChannelRuntimeError};
pub use tools::ToolProvider;
