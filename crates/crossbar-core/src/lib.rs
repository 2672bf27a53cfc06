//! Shared envelope types, error taxonomy, and configuration for the
//! Crossbar messaging gateway.
//!
//! Everything in this crate is a plain value: events, responses,
//! conversation keys, identities, principals, and config structs. The
//! behavioral subsystems (policy, idempotency, sessions, runtime) consume
//! these by value and never hold live references back into each other.

pub mod config;
pub mod error;
pub mod principal;
pub mod tool;
pub mod types;

pub use error::{ErrorCode, ErrorPayload, GatewayError, Result};
pub use principal::Principal;
pub use tool::{ToolCall, ToolDefinition, ToolExecutionResult};
pub use types::{
    ChannelEvent, ChannelIdentity, ChannelResponse, ConversationKey, EventKind, EventPayload,
    ResponsePayload,
};
