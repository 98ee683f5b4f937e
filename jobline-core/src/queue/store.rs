//! Queue storage port and its Redis adapter (§4.1, §6).
//!
//! The port speaks in raw JSON envelope strings rather than [`crate::model::JobEnvelope`]
//! directly — the store only needs to move opaque blobs between lists atomically; envelope
//! (de)serialization is the runtime's concern, the same separation the teacher draws between
//! `JobsRepository`/`QueueService` (domain) and the Postgres adapter (infrastructure).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

use crate::error::{QueueError, Result};

mod scripts {
    use redis::Script;

    /// Atomically removes one matching entry from the processing list and, iff present,
    /// pushes a (possibly mutated) replacement onto `queue` — used by both plain Ack (no
    /// replacement) and Nack-retry (replacement carries `retries+1`).
    pub fn move_from_processing() -> Script {
        Script::new(
            r#"
            local processing_key = KEYS[1]
            local dest_key = KEYS[2]
            local old_json = ARGV[1]
            local new_json = ARGV[2]
            local push_side = ARGV[3]

            local removed = redis.call('LREM', processing_key, 1, old_json)
            if removed == 0 then
                return 0
            end
            if new_json ~= '' then
                if push_side == 'left' then
                    redis.call('LPUSH', dest_key, new_json)
                else
                    redis.call('RPUSH', dest_key, new_json)
                end
            end
            return 1
            "#,
        )
    }

    /// Drains an entire processing list back to the tail of its originating queue, in original
    /// order, in one atomic step — the reaper's reclaim operation. A no-op if the list is
    /// already empty (e.g. a returning worker already cleared it).
    pub fn reap_processing_list() -> Script {
        Script::new(
            r#"
            local processing_key = KEYS[1]
            local queue_key = KEYS[2]
            local entries = redis.call('LRANGE', processing_key, 0, -1)
            if #entries == 0 then
                return 0
            end
            for i = 1, #entries do
                redis.call('RPUSH', queue_key, entries[i])
            end
            redis.call('DEL', processing_key)
            return #entries
            "#,
        )
    }

    /// Schedules an entry for redelivery at `due_at` (epoch seconds) on a per-queue delayed
    /// ZSET, removing it from the processing list in the same round trip.
    pub fn schedule_delayed() -> Script {
        Script::new(
            r#"
            local processing_key = KEYS[1]
            local delayed_key = KEYS[2]
            local old_json = ARGV[1]
            local new_json = ARGV[2]
            local due_at = ARGV[3]

            local removed = redis.call('LREM', processing_key, 1, old_json)
            if removed == 0 then
                return 0
            end
            redis.call('ZADD', delayed_key, due_at, new_json)
            return 1
            "#,
        )
    }

    /// Moves every delayed entry whose due time has passed back onto the live queue.
    pub fn promote_due_delayed() -> Script {
        Script::new(
            r#"
            local delayed_key = KEYS[1]
            local queue_key = KEYS[2]
            local now = ARGV[1]
            local due = redis.call('ZRANGEBYSCORE', delayed_key, '-inf', now)
            for i = 1, #due do
                redis.call('LPUSH', queue_key, due[i])
                redis.call('ZREM', delayed_key, due[i])
            end
            return #due
            "#,
        )
    }

    /// Atomically empties `key`, returning how many entries it held — the admin purge operation.
    pub fn purge_list() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local n = redis.call('LLEN', key)
            redis.call('DEL', key)
            return n
            "#,
        )
    }
}

/// Storage port consumed by [`crate::queue::runtime::QueueRuntime`]. Defined as an `async_trait`
/// so tests can supply an in-memory fake without a live Redis server.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push_left(&self, queue_key: &str, envelope_json: &str) -> Result<()>;

    /// Blocking move of the rightmost entry of `queue_key` onto `processing_key`. Returns
    /// `None` on timeout (empty queue), never consuming an entry in that case.
    async fn dequeue_blocking(
        &self,
        queue_key: &str,
        processing_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Removes `envelope_json` from the processing list. Returns whether an entry was removed
    /// (false means it was already gone — Ack is idempotent).
    async fn remove_from_processing(&self, processing_key: &str, envelope_json: &str) -> Result<bool>;

    /// Atomically removes `old_json` from the processing list and pushes `new_json` onto the
    /// tail of `dest_key` (used by Promote-to-DLQ and immediate requeue paths).
    async fn move_to_tail(&self, processing_key: &str, dest_key: &str, old_json: &str, new_json: &str) -> Result<bool>;

    /// Atomically removes from processing and schedules redelivery on the delayed set.
    async fn schedule_delayed(
        &self,
        processing_key: &str,
        delayed_key: &str,
        old_json: &str,
        new_json: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Promotes every due delayed entry back onto the live queue; returns how many moved.
    async fn promote_due_delayed(&self, delayed_key: &str, queue_key: &str) -> Result<u64>;

    /// Drains a stale processing list back to the tail of its originating queue; returns how
    /// many envelopes were recovered.
    async fn reap_processing_list(&self, processing_key: &str, queue_key: &str) -> Result<u64>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    async fn set_heartbeat(&self, heartbeat_key: &str, ttl: Duration) -> Result<()>;

    async fn heartbeat_is_stale(&self, heartbeat_key: &str) -> Result<bool>;

    /// Reads a range of raw JSON entries from a list (admin DLQ peek), `0..-1` for the whole list.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Atomically empties `key`, returning how many entries it held (admin DLQ purge).
    async fn purge_list(&self, key: &str) -> Result<u64>;

    /// Atomically removes `old_json` from `source_key` (the DLQ) and pushes `new_json` onto the
    /// head of `dest_key` (the live queue) — the admin requeue operation. Returns whether the
    /// entry was found and moved.
    async fn requeue_entry(&self, source_key: &str, dest_key: &str, old_json: &str, new_json: &str) -> Result<bool>;
}

/// Redis-backed [`QueueStore`] using a shared [`ConnectionManager`] (auto-reconnecting, safe to
/// clone and share across tasks — the same client the teacher uses for its cache layer).
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    move_from_processing: Script,
    reap_processing_list: Script,
    schedule_delayed: Script,
    promote_due_delayed: Script,
    purge_list: Script,
}

impl RedisQueueStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Unavailable(format!("redis connect failed: {e}")))?;
        Ok(Self {
            conn,
            move_from_processing: scripts::move_from_processing(),
            reap_processing_list: scripts::reap_processing_list(),
            schedule_delayed: scripts::schedule_delayed(),
            promote_due_delayed: scripts::promote_due_delayed(),
            purge_list: scripts::purge_list(),
        })
    }

    pub fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            move_from_processing: scripts::move_from_processing(),
            reap_processing_list: scripts::reap_processing_list(),
            schedule_delayed: scripts::schedule_delayed(),
            promote_due_delayed: scripts::promote_due_delayed(),
            purge_list: scripts::purge_list(),
        }
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push_left(&self, queue_key: &str, envelope_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(queue_key)
            .arg(envelope_json)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue_blocking(
        &self,
        queue_key: &str,
        processing_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let timeout_secs = timeout.as_secs_f64().max(0.01);
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(queue_key)
            .arg(processing_key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result)
    }

    async fn remove_from_processing(&self, processing_key: &str, envelope_json: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(processing_key)
            .arg(1)
            .arg(envelope_json)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn move_to_tail(
        &self,
        processing_key: &str,
        dest_key: &str,
        old_json: &str,
        new_json: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .move_from_processing
            .key(processing_key)
            .key(dest_key)
            .arg(old_json)
            .arg(new_json)
            .arg("right")
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn schedule_delayed(
        &self,
        processing_key: &str,
        delayed_key: &str,
        old_json: &str,
        new_json: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .schedule_delayed
            .key(processing_key)
            .key(delayed_key)
            .arg(old_json)
            .arg(new_json)
            .arg(due_at.timestamp())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn promote_due_delayed(&self, delayed_key: &str, queue_key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let promoted: i64 = self
            .promote_due_delayed
            .key(delayed_key)
            .key(queue_key)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted.max(0) as u64)
    }

    async fn reap_processing_list(&self, processing_key: &str, queue_key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let recovered: i64 = self
            .reap_processing_list
            .key(processing_key)
            .key(queue_key)
            .invoke_async(&mut conn)
            .await?;
        if recovered > 0 {
            debug!(processing_key, recovered, "reaper recovered stale processing list");
        }
        Ok(recovered.max(0) as u64)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn set_heartbeat(&self, heartbeat_key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(heartbeat_key)
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn heartbeat_is_stale(&self, heartbeat_key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(heartbeat_key)
            .query_async(&mut conn)
            .await?;
        Ok(!exists)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn purge_list(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.purge_list.key(key).invoke_async(&mut conn).await?;
        Ok(removed.max(0) as u64)
    }

    async fn requeue_entry(&self, source_key: &str, dest_key: &str, old_json: &str, new_json: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .move_from_processing
            .key(source_key)
            .key(dest_key)
            .arg(old_json)
            .arg(new_json)
            .arg("left")
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }
}
