//! Exactly-once processing over at-least-once platform delivery.
//!
//! Platforms redeliver events; the [`IdempotencyGuard`] makes sure the
//! processor runs once per `event_id` across every gateway instance, and
//! that duplicates observe the recorded outcome instead of re-running
//! side effects. The store's `try_acquire` atomicity is the crux: the
//! in-memory store serializes through one mutex, and a distributed
//! backend must use a compare-and-set primitive.

pub mod guard;
pub mod record;
pub mod store;

pub use guard::IdempotencyGuard;
pub use record::{IdempotencyRecord, IdempotencyStatus, ProcessOutcome};
pub use store::{IdempotencyStore, InMemoryIdempotencyStore};
