//! Task stream capability.
//!
//! [`TaskStream`] models an append-only log consumed through consumer
//! groups (Redis streams being the reference shape):
//!
//! - each appended entry is delivered to exactly one consumer of a group;
//! - a delivered entry stays *pending* until acknowledged;
//! - pending entries idle for longer than a threshold can be claimed by
//!   another consumer, which is how work held by a dead consumer is
//!   redelivered.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// An entry delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Backend-assigned entry id (`{millis}-{sequence}`).
    pub id: String,
    /// The opaque payload given to [`TaskStream::append`].
    pub payload: Vec<u8>,
}

/// Summary of a delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id.
    pub id: String,
    /// Consumer currently owning the entry.
    pub consumer: String,
    /// Time since the entry was last delivered or claimed.
    pub idle: Duration,
    /// Number of times the entry has been delivered.
    pub delivery_count: u64,
}

/// Append-only log with consumer-group semantics.
#[async_trait]
pub trait TaskStream: Send + Sync {
    /// Creates `group` on `stream` if it does not exist yet, creating the
    /// stream as well when needed. New groups start from the beginning of
    /// the stream so entries appended before any consumer existed are still
    /// delivered. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Appends an entry and returns its id.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, StoreError>;

    /// Delivers the next never-delivered entry of the group to `consumer`,
    /// waiting up to `block` for one to arrive. Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the group does not exist.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError>;

    /// Acknowledges an entry, removing it from the group's pending list.
    /// Any group member may acknowledge any entry. Returns `true` if the
    /// entry was pending.
    async fn acknowledge(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError>;

    /// Lists up to `count` pending entries idle for at least `min_idle`,
    /// oldest first.
    async fn pending_older_than(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Transfers ownership of the given pending entries to `consumer`,
    /// provided each is still idle for at least `min_idle`. Entries that
    /// were acknowledged or claimed by someone else in the meantime are
    /// skipped, so concurrent reclaimers never both win the same entry.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError>;
}
