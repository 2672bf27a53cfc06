//! Per-conversation session state: history, context, principal.
//!
//! All mutation goes through the [`SessionManager`], which applies
//! copy-on-write updates (read from the store, derive, write back) and
//! never leaks shared mutable state. Last-write-wins across concurrent
//! mutations of the same session; callers needing compare-and-swap must
//! sequence at a higher layer.

pub mod manager;
pub mod store;
pub mod types;

pub use manager::SessionManager;
pub use store::{InMemorySessionStore, SessionStore};
pub use types::{MessageRole, Session, SessionMessage, SessionState};
