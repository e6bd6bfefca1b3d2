//! Redis state store and task stream.
//!
//! [`RedisStateStore`] maps [`StateStore`] onto Redis hashes and
//! [`RedisTaskStream`] maps [`TaskStream`] onto Redis streams:
//!
//! | Trait method | Redis command |
//! |--------------|---------------|
//! | `read_all` | `HGETALL` |
//! | `read_field` | `HGET` |
//! | `write_field` | `HSET` |
//! | `write_field_if_absent` | `HSETNX` |
//! | `write_if` | Lua script: `HGET` guard, then `HSET` per write |
//! | `delete_field` | `HDEL` |
//! | `delete_key` | `DEL` |
//! | `ensure_group` | `XGROUP CREATE <stream> <group> 0 MKSTREAM` |
//! | `append` | `XADD <stream> * payload <bytes>` |
//! | `read_group` | `XREADGROUP GROUP <group> <consumer> COUNT 1 BLOCK <ms> STREAMS <stream> >` |
//! | `acknowledge` | `XACK` |
//! | `pending_older_than` | `XPENDING <stream> <group> IDLE <ms> - + <count>` |
//! | `claim` | `XCLAIM <stream> <group> <consumer> <min-idle-ms> <ids..>` |
//!
//! Both hold a [`MultiplexedConnection`], which is cheap to clone; every
//! call clones it so one backend can be shared across tasks.
//!
//! A multiplexed connection answers requests in order, so a blocked
//! `XREADGROUP` would hold up every command queued behind it. The stream
//! therefore keeps a second connection that only carries `read_group`.
//! Workers sharing one stream backend also share that connection and take
//! turns blocking on it; heartbeats, status writes and acknowledgements
//! never wait behind a read.
//!
//! An optional key prefix (`{prefix}:{key}`) isolates test runs sharing a
//! Redis instance.
//!
//! # Usage
//!
//! ```rust,no_run
//! use remote_futures_store::redis::{RedisStateStore, RedisTaskStream};
//!
//! # async fn example() {
//! let state = RedisStateStore::new("redis://127.0.0.1:6379").await.unwrap();
//! let stream = RedisTaskStream::new("redis://127.0.0.1:6379").await.unwrap();
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::{FieldGuard, FieldWrite, StateStore};
use crate::stream::{PendingEntry, StreamEntry, TaskStream};

/// Field under which stream entries carry their payload.
const PAYLOAD_FIELD: &str = "payload";

/// Guarded multi-hash write.
///
/// KEYS[1] is the guarded hash, KEYS[2..] the hashes written to.
/// ARGV: guard field, number of accepted values, the accepted values, then
/// one field/value pair per written key.
///
/// Returns 1 if the writes were applied, 0 if the guard did not match.
const LUA_WRITE_IF: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if not current then
    return 0
end

local accepted = tonumber(ARGV[2])
local matched = false
for i = 3, 2 + accepted do
    if current == ARGV[i] then
        matched = true
        break
    end
end
if not matched then
    return 0
end

local next_arg = 3 + accepted
for k = 2, #KEYS do
    redis.call('HSET', KEYS[k], ARGV[next_arg], ARGV[next_arg + 1])
    next_arg = next_arg + 2
end
return 1
"#;

/// Opens a multiplexed connection to the Redis server at `url`.
///
/// The URL format is `redis://[:<password>@]<host>:<port>[/<db>]`.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if the client cannot be created or the
/// connection cannot be established.
pub async fn connect(url: &str) -> Result<MultiplexedConnection, StoreError> {
    let client = ::redis::Client::open(url).map_err(|e| StoreError::Backend {
        message: format!("failed to create Redis client: {e}"),
        source: Some(Box::new(e)),
    })?;
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| StoreError::Backend {
            message: format!("failed to connect to Redis: {e}"),
            source: Some(Box::new(e)),
        })
}

/// Maps a Redis error to a [`StoreError::Backend`].
fn map_redis_error(err: ::redis::RedisError, key: &str) -> StoreError {
    StoreError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn prefixed(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{key}"),
        None => key.to_string(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// RedisStateStore
// ---------------------------------------------------------------------------

/// [`StateStore`] backed by Redis hashes.
#[derive(Debug, Clone)]
pub struct RedisStateStore {
    conn: MultiplexedConnection,
    key_prefix: Option<String>,
}

impl RedisStateStore {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection fails.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        Ok(Self::with_connection(connect(url).await?))
    }

    /// Wraps an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: None,
        }
    }

    /// Sets a key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Returns a clone of the underlying connection, e.g. to reuse it for
    /// the non-blocking commands of a [`RedisTaskStream`].
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn key(&self, key: &str) -> String {
        prefixed(self.key_prefix.as_deref(), key)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn read_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn
            .hgetall(self.key(key))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(fields)
    }

    async fn read_field(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .hget(self.key(key), field)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(value)
    }

    async fn write_field(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("HSET")
            .arg(self.key(key))
            .arg(field)
            .arg(value.to_vec())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn write_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let written: i64 = ::redis::cmd("HSETNX")
            .arg(self.key(key))
            .arg(field)
            .arg(value.to_vec())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(written == 1)
    }

    async fn write_if(
        &self,
        guard: FieldGuard<'_>,
        writes: &[FieldWrite<'_>],
    ) -> Result<bool, StoreError> {
        let script = Script::new(LUA_WRITE_IF);
        let mut invocation = script.prepare_invoke();
        invocation.key(self.key(guard.key));
        for write in writes {
            invocation.key(self.key(write.key));
        }
        invocation.arg(guard.field).arg(guard.expected.len());
        for expected in guard.expected {
            invocation.arg(expected.to_vec());
        }
        for write in writes {
            invocation.arg(write.field).arg(write.value.to_vec());
        }
        let applied: i64 = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, guard.key))?;
        Ok(applied == 1)
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("HDEL")
            .arg(self.key(key))
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }
}

// ---------------------------------------------------------------------------
// RedisTaskStream
// ---------------------------------------------------------------------------

/// [`TaskStream`] backed by Redis streams and consumer groups.
#[derive(Debug, Clone)]
pub struct RedisTaskStream {
    conn: MultiplexedConnection,
    /// Carries `XREADGROUP ... BLOCK` only.
    blocking: MultiplexedConnection,
    key_prefix: Option<String>,
}

impl RedisTaskStream {
    /// Connects to Redis at `url`, opening one connection for commands and
    /// one for blocking reads.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if either connection fails.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let conn = connect(url).await?;
        let blocking = connect(url).await?;
        Ok(Self::with_connections(conn, blocking))
    }

    /// Wraps existing connections. `blocking` must not be shared with
    /// anything that cannot wait out a blocked read.
    pub fn with_connections(conn: MultiplexedConnection, blocking: MultiplexedConnection) -> Self {
        Self {
            conn,
            blocking,
            key_prefix: None,
        }
    }

    /// Sets a key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn key(&self, stream: &str) -> String {
        prefixed(self.key_prefix.as_deref(), stream)
    }
}

fn entry_from_stream_id(stream: &str, entry: &StreamId) -> Result<StreamEntry, StoreError> {
    let payload: Vec<u8> = entry
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| StoreError::Protocol {
            message: format!("entry {} of {stream} has no {PAYLOAD_FIELD} field", entry.id),
        })?;
    Ok(StreamEntry {
        id: entry.id.clone(),
        payload,
    })
}

#[async_trait]
impl TaskStream for RedisTaskStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let result: Result<(), ::redis::RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.key(stream))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e, stream)),
        }
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = ::redis::cmd("XADD")
            .arg(self.key(stream))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload.to_vec())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, stream))?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, StoreError> {
        let mut conn = self.blocking.clone();
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
        // BLOCK 0 means "forever" in Redis; a zero duration here means "don't block".
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(duration_ms(block));
        }
        cmd.arg("STREAMS").arg(self.key(stream)).arg(">");

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await.map_err(|e| {
            if e.code() == Some("NOGROUP") {
                StoreError::NotFound {
                    key: format!("{stream} (group {group})"),
                }
            } else {
                map_redis_error(e, stream)
            }
        })?;

        let Some(reply) = reply else {
            return Ok(None);
        };
        reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .next()
            .map(|entry| entry_from_stream_id(stream, entry))
            .transpose()
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let acked: i64 = ::redis::cmd("XACK")
            .arg(self.key(stream))
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, stream))?;
        Ok(acked > 0)
    }

    async fn pending_older_than(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<(String, String, u64, u64)> = ::redis::cmd("XPENDING")
            .arg(self.key(stream))
            .arg(group)
            .arg("IDLE")
            .arg(duration_ms(min_idle))
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, stream))?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                delivery_count,
            })
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
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XCLAIM");
        cmd.arg(self.key(stream))
            .arg(group)
            .arg(consumer)
            .arg(duration_ms(min_idle));
        for id in ids {
            cmd.arg(id);
        }
        let reply: StreamClaimReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, stream))?;

        reply
            .ids
            .iter()
            .map(|entry| entry_from_stream_id(stream, entry))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Integration tests -- Redis backend contract tests
// ---------------------------------------------------------------------------

/// Integration tests against a real Redis instance.
///
/// Require a running Redis (default `redis://127.0.0.1:6379`, override with
/// `REDIS_URL`). Run with:
///
/// ```bash
/// cargo test -p remote-futures-store --features redis-tests -- redis_
/// ```
///
/// Every test uses a unique UUID prefix, so no cleanup is needed.
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    async fn test_backends() -> (RedisStateStore, RedisTaskStream) {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("test-{}", uuid::Uuid::new_v4());
        let state = RedisStateStore::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_prefix(prefix.clone());
        let blocking = connect(&url)
            .await
            .expect("Redis connection failed -- is Redis running?");
        let stream =
            RedisTaskStream::with_connections(state.connection(), blocking).with_prefix(prefix);
        (state, stream)
    }

    #[tokio::test]
    async fn redis_hash_round_trip() {
        let (state, _) = test_backends().await;
        state.write_field("op:status", "t1", b"0").await.unwrap();
        state.write_field("op:status", "t2", b"1").await.unwrap();

        let all = state.read_all("op:status").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            state.read_field("op:status", "t2").await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(state.read_field("op:status", "t3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn redis_write_if_absent() {
        let (state, _) = test_backends().await;
        assert!(state.write_field_if_absent("k", "f", b"1").await.unwrap());
        assert!(!state.write_field_if_absent("k", "f", b"2").await.unwrap());
        assert_eq!(state.read_field("k", "f").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn redis_write_if_guards_on_current_value() {
        let (state, _) = test_backends().await;
        let open: &[&[u8]] = &[b"0", b"1"];
        let guard = FieldGuard {
            key: "op:status",
            field: "t",
            expected: open,
        };
        let writes = [
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
        ];

        assert!(!state.write_if(guard, &writes).await.unwrap());
        assert_eq!(state.read_field("op:results", "t").await.unwrap(), None);

        state.write_field("op:status", "t", b"1").await.unwrap();
        assert!(state.write_if(guard, &writes).await.unwrap());
        assert_eq!(
            state.read_field("op:results", "t").await.unwrap(),
            Some(b"42".to_vec())
        );

        // now terminal, so a second attempt is refused
        assert!(!state.write_if(guard, &writes[1..]).await.unwrap());
        assert_eq!(
            state.read_field("op:status", "t").await.unwrap(),
            Some(b"2".to_vec())
        );
    }

    #[tokio::test]
    async fn redis_blocked_read_does_not_stall_commands() {
        let (state, stream) = test_backends().await;
        stream.ensure_group("tasks", "workers").await.unwrap();
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .read_group("tasks", "workers", "c1", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        stream.append("tasks", b"x").await.unwrap();
        state.write_field("op:heartbeat", "t", b"1.0").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let entry = reader.await.unwrap().unwrap();
        assert_eq!(entry.map(|e| e.payload), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn redis_delete_key_and_field() {
        let (state, _) = test_backends().await;
        state.write_field("k", "a", b"1").await.unwrap();
        state.write_field("k", "b", b"2").await.unwrap();
        assert!(state.delete_field("k", "a").await.unwrap());
        assert!(!state.delete_field("k", "a").await.unwrap());
        assert!(state.delete_key("k").await.unwrap());
        assert!(state.read_all("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redis_stream_group_delivery_and_ack() {
        let (_, stream) = test_backends().await;
        stream.ensure_group("tasks", "workers").await.unwrap();
        stream.ensure_group("tasks", "workers").await.unwrap();
        let id = stream.append("tasks", b"payload").await.unwrap();

        let entry = stream
            .read_group("tasks", "workers", "c1", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("entry delivered");
        assert_eq!(entry.id, id);
        assert_eq!(entry.payload, b"payload".to_vec());

        let none = stream
            .read_group("tasks", "workers", "c2", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(none.is_none());
        assert!(stream.acknowledge("tasks", "workers", &id).await.unwrap());
    }

    #[tokio::test]
    async fn redis_stream_reclaim() {
        let (_, stream) = test_backends().await;
        stream.ensure_group("tasks", "workers").await.unwrap();
        let id = stream.append("tasks", b"x").await.unwrap();
        stream
            .read_group("tasks", "workers", "dead", Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let pending = stream
            .pending_older_than("tasks", "workers", Duration::from_millis(50), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "dead");

        let claimed = stream
            .claim(
                "tasks",
                "workers",
                "alive",
                Duration::from_millis(50),
                &[id.clone()],
            )
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
    }

    #[tokio::test]
    async fn redis_read_without_group_is_not_found() {
        let (_, stream) = test_backends().await;
        stream.append("tasks", b"x").await.unwrap();
        let result = stream
            .read_group("tasks", "missing", "c1", Duration::ZERO)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
