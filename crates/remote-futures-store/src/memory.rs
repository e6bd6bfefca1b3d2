//! In-memory state store and task stream.
//!
//! [`InMemoryStateStore`] keeps hash mappings in a `DashMap<String,
//! HashMap<String, Vec<u8>>>`, giving each key its own shard-level lock.
//! Guarded writes span several keys, so mutations also pass through a
//! store-wide gate: plain writes share it, [`StateStore::write_if`] holds it
//! exclusively.
//!
//! [`InMemoryTaskStream`] implements consumer groups with the same observable
//! behaviour as Redis streams: per-group delivery cursor, pending entry list,
//! idle-time based claiming. Blocking reads park on a [`Notify`] that every
//! append wakes. Entries that every group has delivered and acknowledged are
//! dropped, so a long-lived stream only retains in-flight work.
//!
//! Both are meant for tests and single-process pools; they share nothing
//! across processes.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use remote_futures_store::{InMemoryTaskStream, TaskStream};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let stream = InMemoryTaskStream::new();
//! stream.ensure_group("app:tasks", "app:workers").await.unwrap();
//! stream.append("app:tasks", b"hello").await.unwrap();
//!
//! let entry = stream
//!     .read_group("app:tasks", "app:workers", "worker-1", Duration::ZERO)
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(entry.payload, b"hello");
//! assert!(stream.acknowledge("app:tasks", "app:workers", &entry.id).await.unwrap());
//! # });
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::error::StoreError;
use crate::state::{FieldGuard, FieldWrite, StateStore};
use crate::stream::{PendingEntry, StreamEntry, TaskStream};

// ---- InMemoryStateStore ----

/// Thread-safe in-memory [`StateStore`].
///
/// A key whose last field is deleted disappears, matching Redis hash
/// semantics.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    data: DashMap<String, HashMap<String, Vec<u8>>>,
    gate: RwLock<()>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` currently holds at least one field.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns all keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        Ok(self
            .data
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn read_field(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .data
            .get(key)
            .and_then(|entry| entry.value().get(field).cloned()))
    }

    async fn write_field(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let _shared = self.gate.read();
        self.data
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn write_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let _shared = self.gate.read();
        let mut fields = self.data.entry(key.to_string()).or_default();
        if fields.contains_key(field) {
            return Ok(false);
        }
        fields.insert(field.to_string(), value.to_vec());
        Ok(true)
    }

    async fn write_if(
        &self,
        guard: FieldGuard<'_>,
        writes: &[FieldWrite<'_>],
    ) -> Result<bool, StoreError> {
        let _exclusive = self.gate.write();
        let current = self
            .data
            .get(guard.key)
            .and_then(|entry| entry.value().get(guard.field).cloned());
        if !guard.matches(current.as_deref()) {
            return Ok(false);
        }
        for write in writes {
            self.data
                .entry(write.key.to_string())
                .or_default()
                .insert(write.field.to_string(), write.value.to_vec());
        }
        Ok(true)
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let _shared = self.gate.read();
        let removed = match self.data.get_mut(key) {
            Some(mut fields) => fields.remove(field).is_some(),
            None => return Ok(false),
        };
        self.data.remove_if(key, |_, fields| fields.is_empty());
        Ok(removed)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        let _shared = self.gate.read();
        Ok(self.data.remove(key).is_some())
    }
}

// ---- InMemoryTaskStream ----

#[derive(Debug)]
struct StoredEntry {
    id: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct PendingSlot {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    next_index: usize,
    /// Pending entries keyed by entry index (so iteration is oldest first).
    pending: BTreeMap<usize, PendingSlot>,
}

/// Retained entries, addressed by absolute index.
#[derive(Debug, Default)]
struct EntryLog {
    /// Absolute index of `items[0]`.
    base: usize,
    items: VecDeque<StoredEntry>,
    index_by_id: HashMap<String, usize>,
}

impl EntryLog {
    fn get(&self, index: usize) -> Option<&StoredEntry> {
        self.items.get(index.checked_sub(self.base)?)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.index_by_id.get(id).copied()
    }

    fn push(&mut self, entry: StoredEntry) {
        self.index_by_id
            .insert(entry.id.clone(), self.base + self.items.len());
        self.items.push_back(entry);
    }

    fn drop_before(&mut self, floor: usize) {
        while self.base < floor {
            let Some(entry) = self.items.pop_front() else {
                break;
            };
            self.index_by_id.remove(&entry.id);
            self.base += 1;
        }
    }
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: EntryLog,
    groups: HashMap<String, GroupState>,
    last_id: (i64, u64),
}

impl StreamLog {
    /// Drops entries every group has delivered and acknowledged.
    fn compact(&mut self) {
        let floor = self
            .groups
            .values()
            .map(|g| g.pending.keys().next().copied().unwrap_or(g.next_index))
            .min();
        if let Some(floor) = floor {
            self.entries.drop_before(floor);
        }
    }

    fn next_id(&mut self) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        self.last_id = if millis > self.last_id.0 {
            (millis, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        format!("{}-{}", self.last_id.0, self.last_id.1)
    }
}

fn group_not_found(stream: &str, group: &str) -> StoreError {
    StoreError::NotFound {
        key: format!("{stream} (group {group})"),
    }
}

/// In-memory [`TaskStream`] with consumer-group semantics.
#[derive(Debug, Default)]
pub struct InMemoryTaskStream {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
}

impl InMemoryTaskStream {
    /// Creates an empty stream registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries `stream` still retains.
    ///
    /// Once every group has acknowledged an entry it is dropped and no longer
    /// counted.
    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map_or(0, |log| log.entries.items.len())
    }

    /// Returns `true` if `stream` retains no entries.
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Number of delivered but unacknowledged entries of `group`.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn try_deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let mut streams = self.streams.lock();
        let StreamLog {
            entries, groups, ..
        } = streams
            .get_mut(stream)
            .ok_or_else(|| group_not_found(stream, group))?;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| group_not_found(stream, group))?;

        let index = state.next_index.max(entries.base);
        let Some(entry) = entries.get(index) else {
            return Ok(None);
        };
        state.next_index = index + 1;
        state.pending.insert(
            index,
            PendingSlot {
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                delivery_count: 1,
            },
        );
        Ok(Some(StreamEntry {
            id: entry.id.clone(),
            payload: entry.payload.clone(),
        }))
    }
}

#[async_trait]
impl TaskStream for InMemoryTaskStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        let base = log.entries.base;
        log.groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                next_index: base,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, StoreError> {
        let id = {
            let mut streams = self.streams.lock();
            let log = streams.entry(stream.to_string()).or_default();
            let id = log.next_id();
            log.entries.push(StoredEntry {
                id: id.clone(),
                payload: payload.to_vec(),
            });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_deliver(stream, group, consumer)? {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        let mut streams = self.streams.lock();
        let Some(log) = streams.get_mut(stream) else {
            return Ok(false);
        };
        let Some(index) = log.entries.index_of(id) else {
            return Ok(false);
        };
        let removed = log
            .groups
            .get_mut(group)
            .is_some_and(|state| state.pending.remove(&index).is_some());
        if removed {
            log.compact();
        }
        Ok(removed)
    }

    async fn pending_older_than(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let streams = self.streams.lock();
        let log = streams
            .get(stream)
            .ok_or_else(|| group_not_found(stream, group))?;
        let state = log
            .groups
            .get(group)
            .ok_or_else(|| group_not_found(stream, group))?;

        Ok(state
            .pending
            .iter()
            .filter_map(|(index, slot)| {
                let idle = slot.delivered_at.elapsed();
                let entry = log.entries.get(*index)?;
                (idle >= min_idle).then(|| PendingEntry {
                    id: entry.id.clone(),
                    consumer: slot.consumer.clone(),
                    idle,
                    delivery_count: slot.delivery_count,
                })
            })
            .take(count)
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut streams = self.streams.lock();
        let StreamLog {
            entries, groups, ..
        } = streams
            .get_mut(stream)
            .ok_or_else(|| group_not_found(stream, group))?;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| group_not_found(stream, group))?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(index) = entries.index_of(id) else {
                continue;
            };
            let Some(entry) = entries.get(index) else {
                continue;
            };
            let Some(slot) = state.pending.get_mut(&index) else {
                continue;
            };
            if slot.delivered_at.elapsed() < min_idle {
                continue;
            }
            slot.consumer = consumer.to_string();
            slot.delivered_at = Instant::now();
            slot.delivery_count += 1;
            claimed.push(StreamEntry {
                id: entry.id.clone(),
                payload: entry.payload.clone(),
            });
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[tokio::test]
    async fn read_all_missing_key_is_empty() {
        let store = InMemoryStateStore::new();
        assert!(store.read_all("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_then_read_field() {
        let store = InMemoryStateStore::new();
        store.write_field("k", "f", b"v").await.unwrap();
        assert_eq!(store.read_field("k", "f").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.read_field("k", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_field_overwrites() {
        let store = InMemoryStateStore::new();
        store.write_field("k", "f", b"1").await.unwrap();
        store.write_field("k", "f", b"2").await.unwrap();
        assert_eq!(store.read_field("k", "f").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn write_if_absent_keeps_first_value() {
        let store = InMemoryStateStore::new();
        assert!(store.write_field_if_absent("k", "f", b"1").await.unwrap());
        assert!(!store.write_field_if_absent("k", "f", b"2").await.unwrap());
        assert_eq!(store.read_field("k", "f").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn delete_last_field_removes_key() {
        let store = InMemoryStateStore::new();
        store.write_field("k", "a", b"1").await.unwrap();
        store.write_field("k", "b", b"2").await.unwrap();

        assert!(store.delete_field("k", "a").await.unwrap());
        assert!(store.contains_key("k"));
        assert!(store.delete_field("k", "b").await.unwrap());
        assert!(!store.contains_key("k"));
        assert!(!store.delete_field("k", "b").await.unwrap());
    }

    #[tokio::test]
    async fn delete_key_is_idempotent() {
        let store = InMemoryStateStore::new();
        store.write_field("k", "f", b"v").await.unwrap();
        assert!(store.delete_key("k").await.unwrap());
        assert!(!store.delete_key("k").await.unwrap());
        assert!(store.read_all("k").await.unwrap().is_empty());
    }

    const OPEN: &[&[u8]] = &[b"0", b"1"];

    fn status_guard(expected: &'static [&'static [u8]]) -> FieldGuard<'static> {
        FieldGuard {
            key: "op:status",
            field: "t",
            expected,
        }
    }

    #[tokio::test]
    async fn write_if_applies_all_writes_when_guard_matches() {
        let store = InMemoryStateStore::new();
        store.write_field("op:status", "t", b"1").await.unwrap();

        let applied = store
            .write_if(
                status_guard(OPEN),
                &[
                    FieldWrite {
                        key: "op:results",
                        field: "t",
                        value: b"42",
                    },
                    FieldWrite {
                        key: "op:status",
                        field: "t",
                        value: b"2",
                    },
                ],
            )
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(store.read_field("op:results", "t").await.unwrap(), Some(b"42".to_vec()));
        assert_eq!(store.read_field("op:status", "t").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn write_if_leaves_store_alone_on_mismatch() {
        let store = InMemoryStateStore::new();
        store.write_field("op:status", "t", b"3").await.unwrap();

        let applied = store
            .write_if(
                status_guard(OPEN),
                &[FieldWrite {
                    key: "op:status",
                    field: "t",
                    value: b"1",
                }],
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.read_field("op:status", "t").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn write_if_never_matches_absent_field() {
        let store = InMemoryStateStore::new();
        let applied = store
            .write_if(
                status_guard(OPEN),
                &[FieldWrite {
                    key: "op:status",
                    field: "t",
                    value: b"1",
                }],
            )
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.keys().is_empty());
    }
}

#[cfg(test)]
mod stream_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STREAM: &str = "app:tasks";
    const GROUP: &str = "app:workers";

    async fn stream_with_group() -> InMemoryTaskStream {
        let stream = InMemoryTaskStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let stream = stream_with_group().await;
        let a = stream.append(STREAM, b"a").await.unwrap();
        let b = stream.append(STREAM, b"b").await.unwrap();
        assert_ne!(a, b);
        let parse = |id: &str| -> (i64, u64) {
            let (ms, seq) = id.split_once('-').unwrap();
            (ms.parse().unwrap(), seq.parse().unwrap())
        };
        assert!(parse(&a) < parse(&b));
    }

    #[tokio::test]
    async fn each_entry_delivered_to_one_consumer() {
        let stream = stream_with_group().await;
        stream.append(STREAM, b"one").await.unwrap();

        let first = stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap();
        let second = stream
            .read_group(STREAM, GROUP, "c2", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.map(|e| e.payload), Some(b"one".to_vec()));
        assert_eq!(second, None);
        assert_eq!(stream.pending_count(STREAM, GROUP), 1);
    }

    #[tokio::test]
    async fn group_created_late_sees_earlier_entries() {
        let stream = InMemoryTaskStream::new();
        stream.append(STREAM, b"early").await.unwrap();
        stream.ensure_group(STREAM, GROUP).await.unwrap();

        let entry = stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entry.map(|e| e.payload), Some(b"early".to_vec()));
    }

    #[tokio::test]
    async fn read_without_group_is_not_found() {
        let stream = InMemoryTaskStream::new();
        let result = stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let stream = std::sync::Arc::new(stream_with_group().await);
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .read_group(STREAM, GROUP, "c1", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.append(STREAM, b"late").await.unwrap();

        let entry = reader.await.unwrap().unwrap();
        assert_eq!(entry.map(|e| e.payload), Some(b"late".to_vec()));
    }

    #[tokio::test]
    async fn blocking_read_times_out() {
        let stream = stream_with_group().await;
        let entry = stream
            .read_group(STREAM, GROUP, "c1", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(entry, None);
    }

    #[tokio::test]
    async fn acknowledge_clears_pending() {
        let stream = stream_with_group().await;
        let id = stream.append(STREAM, b"x").await.unwrap();
        stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap();

        assert!(stream.acknowledge(STREAM, GROUP, &id).await.unwrap());
        assert!(!stream.acknowledge(STREAM, GROUP, &id).await.unwrap());
        assert_eq!(stream.pending_count(STREAM, GROUP), 0);
    }

    #[tokio::test]
    async fn pending_respects_min_idle() {
        let stream = stream_with_group().await;
        stream.append(STREAM, b"x").await.unwrap();
        stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap();

        let fresh = stream
            .pending_older_than(STREAM, GROUP, Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(fresh.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stale = stream
            .pending_older_than(STREAM, GROUP, Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].consumer, "c1");
        assert_eq!(stale[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn claim_transfers_ownership_once() {
        let stream = stream_with_group().await;
        let id = stream.append(STREAM, b"x").await.unwrap();
        stream
            .read_group(STREAM, GROUP, "dead", Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let min_idle = Duration::from_millis(20);
        let ids = vec![id.clone()];
        let won = stream
            .claim(STREAM, GROUP, "c2", min_idle, &ids)
            .await
            .unwrap();
        let lost = stream
            .claim(STREAM, GROUP, "c3", min_idle, &ids)
            .await
            .unwrap();

        assert_eq!(won.len(), 1);
        assert_eq!(won[0].payload, b"x".to_vec());
        assert!(lost.is_empty());

        let pending = stream
            .pending_older_than(STREAM, GROUP, Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn claim_skips_acknowledged_entries() {
        let stream = stream_with_group().await;
        let id = stream.append(STREAM, b"x").await.unwrap();
        stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap();
        stream.acknowledge(STREAM, GROUP, &id).await.unwrap();

        let claimed = stream
            .claim(STREAM, GROUP, "c2", Duration::ZERO, &[id])
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }
    #[tokio::test]
    async fn acknowledged_entries_are_dropped() {
        let stream = stream_with_group().await;
        let first = stream.append(STREAM, b"a").await.unwrap();
        let second = stream.append(STREAM, b"b").await.unwrap();
        for _ in 0..2 {
            stream
                .read_group(STREAM, GROUP, "c1", Duration::ZERO)
                .await
                .unwrap();
        }

        // the older entry is still pending, so nothing can go yet
        stream.acknowledge(STREAM, GROUP, &second).await.unwrap();
        assert_eq!(stream.len(STREAM), 2);

        stream.acknowledge(STREAM, GROUP, &first).await.unwrap();
        assert_eq!(stream.len(STREAM), 0);
        assert!(stream.is_empty(STREAM));
        assert!(!stream.acknowledge(STREAM, GROUP, &first).await.unwrap());

        let third = stream.append(STREAM, b"c").await.unwrap();
        let entry = stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.id, third);
        assert_eq!(entry.payload, b"c".to_vec());
    }

    #[tokio::test]
    async fn entries_are_kept_until_every_group_acknowledges() {
        let stream = stream_with_group().await;
        stream.ensure_group(STREAM, "audit").await.unwrap();
        let id = stream.append(STREAM, b"x").await.unwrap();
        stream
            .read_group(STREAM, GROUP, "c1", Duration::ZERO)
            .await
            .unwrap();
        stream.acknowledge(STREAM, GROUP, &id).await.unwrap();
        assert_eq!(stream.len(STREAM), 1);

        let entry = stream
            .read_group(STREAM, "audit", "c2", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entry.map(|e| e.payload), Some(b"x".to_vec()));
        stream.acknowledge(STREAM, "audit", &id).await.unwrap();
        assert_eq!(stream.len(STREAM), 0);

        stream.ensure_group(STREAM, "late").await.unwrap();
        let none = stream
            .read_group(STREAM, "late", "c3", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(none, None);
    }
}
