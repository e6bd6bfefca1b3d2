//! Coordination substrate for `remote-futures`.
//!
//! This crate defines the two external collaborators the task-state protocol
//! is built on, as capability traits, together with their backends:
//!
//! - [`StateStore`] -- a hash-like key/field/value store with atomic field
//!   reads and writes, a set-if-absent primitive and a guarded multi-field
//!   write. The protocol keeps the
//!   status, heartbeat and results mappings of every operation here.
//! - [`TaskStream`] -- an append-only log with grouped consumption, explicit
//!   acknowledgement and reclaim of messages left pending by dead consumers.
//!
//! Backends are dumb transports: they never interpret the bytes they hold.
//! All protocol logic (status encoding, claim rules, failure detection)
//! lives in the `remote-futures` crate.
//!
//! # Backends
//!
//! - [`memory::InMemoryStateStore`] / [`memory::InMemoryTaskStream`] --
//!   process-local implementations with real consumer-group semantics.
//! - `redis::RedisStateStore` / `redis::RedisTaskStream` -- Redis hashes and
//!   streams. Available behind the `redis` feature flag.

pub mod error;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod state;
pub mod stream;

pub use error::StoreError;
pub use memory::{InMemoryStateStore, InMemoryTaskStream};
pub use state::{FieldGuard, FieldWrite, StateStore};
pub use stream::{PendingEntry, StreamEntry, TaskStream};
