//! Redis-backed idempotency reservation store (§4.2).

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;

use crate::error::Result;
use crate::keys;

mod scripts {
    use redis::Script;

    /// `EXISTS` + `SETEX` + `HINCRBY` in one round trip: reserving a key that's already present
    /// is a Duplicate (and bumps the duplicates counter); reserving a fresh key sets it with the
    /// given TTL (and bumps the processed counter).
    pub fn check_and_reserve() -> Script {
        Script::new(
            r#"
            local res_key = KEYS[1]
            local stats_key = KEYS[2]
            local ttl = tonumber(ARGV[1])

            local existed = redis.call('EXISTS', res_key)
            if existed == 1 then
                redis.call('HINCRBY', stats_key, 'duplicates', 1)
                return 0
            end
            redis.call('SETEX', res_key, ttl, '1')
            redis.call('HINCRBY', stats_key, 'processed', 1)
            return 1
            "#,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    Reserved,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct IdempotencyStats {
    pub processed: u64,
    pub duplicates: u64,
    pub active_keys: u64,
}

impl IdempotencyStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.processed + self.duplicates;
        if total == 0 {
            0.0
        } else {
            self.duplicates as f64 / total as f64
        }
    }

    /// Rough storage-footprint estimate in bytes, counted the way the teacher's cache stats
    /// report size — a fixed per-entry overhead plus the key length.
    pub fn storage_size_estimate(&self, avg_key_len: usize) -> u64 {
        self.active_keys * (avg_key_len as u64 + 48)
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn check_and_reserve(&self, key: &str, ttl: Duration) -> Result<IdempotencyOutcome>;
    async fn release(&self, key: &str) -> Result<()>;
    async fn confirm(&self, key: &str, retention: Duration) -> Result<()>;
    async fn stats(&self) -> Result<IdempotencyStats>;
}

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    check_and_reserve: Script,
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            check_and_reserve: scripts::check_and_reserve(),
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn check_and_reserve(&self, key: &str, ttl: Duration) -> Result<IdempotencyOutcome> {
        let mut conn = self.conn.clone();
        let reserved: i64 = self
            .check_and_reserve
            .key(keys::idempotency_key(key))
            .key(keys::idempotency_stats_key())
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(if reserved == 1 {
            IdempotencyOutcome::Reserved
        } else {
            IdempotencyOutcome::Duplicate
        })
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys::idempotency_key(key))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn confirm(&self, key: &str, retention: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(keys::idempotency_key(key))
            .arg(retention.as_secs().max(1))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<IdempotencyStats> {
        let mut conn = self.conn.clone();
        let (processed, duplicates): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(keys::idempotency_stats_key())
            .arg("processed")
            .arg("duplicates")
            .query_async(&mut conn)
            .await?;

        // SCAN rather than KEYS — active_keys is a point-in-time estimate, not exact, and must
        // never block the server on a large keyspace.
        let pattern = format!("{}*", keys::idempotency_key(""));
        let mut cursor: u64 = 0;
        let mut active_keys: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            active_keys += batch.len() as u64;
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(IdempotencyStats {
            processed: processed.unwrap_or(0),
            duplicates: duplicates.unwrap_or(0),
            active_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_with_no_traffic() {
        let stats = IdempotencyStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_duplicate_proportion() {
        let stats = IdempotencyStats {
            processed: 90,
            duplicates: 10,
            active_keys: 90,
        };
        assert!((stats.hit_rate() - 0.1).abs() < 1e-9);
    }
}
