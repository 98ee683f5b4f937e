//! In-memory fakes shared across unit tests, standing in for Redis and Postgres the same way the
//! teacher swaps a repository trait's Postgres adapter for an in-memory one in its own tests.
//! Only compiled under `#[cfg(test)]` — never part of the public surface.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::idempotency::{IdempotencyOutcome, IdempotencyStats, IdempotencyStore};
use crate::queue::store::QueueStore;

/// An in-memory [`QueueStore`]: every list is a plain `VecDeque<String>` guarded by one mutex,
/// so list moves are atomic by construction the same way a single Lua script is atomic in Redis.
#[derive(Default)]
pub struct FakeQueueStore {
    lists: parking_lot::Mutex<HashMap<String, VecDeque<String>>>,
    heartbeats: parking_lot::Mutex<HashSet<String>>,
    pub fail_push: AtomicBool,
}

impl FakeQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for FakeQueueStore {
    async fn push_left(&self, queue_key: &str, envelope_json: &str) -> Result<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("simulated store outage".into()));
        }
        self.lists.lock().entry(queue_key.to_string()).or_default().push_front(envelope_json.to_string());
        Ok(())
    }

    async fn dequeue_blocking(&self, queue_key: &str, processing_key: &str, _timeout: Duration) -> Result<Option<String>> {
        let mut lists = self.lists.lock();
        let popped = lists.get_mut(queue_key).and_then(VecDeque::pop_back);
        if let Some(value) = &popped {
            lists.entry(processing_key.to_string()).or_default().push_back(value.clone());
        }
        Ok(popped)
    }

    async fn remove_from_processing(&self, processing_key: &str, envelope_json: &str) -> Result<bool> {
        let mut lists = self.lists.lock();
        let Some(list) = lists.get_mut(processing_key) else { return Ok(false) };
        if let Some(pos) = list.iter().position(|v| v == envelope_json) {
            list.remove(pos);
            return Ok(true);
        }
        Ok(false)
    }

    async fn move_to_tail(&self, processing_key: &str, dest_key: &str, old_json: &str, new_json: &str) -> Result<bool> {
        let mut lists = self.lists.lock();
        let removed = lists
            .get_mut(processing_key)
            .and_then(|list| list.iter().position(|v| v == old_json).map(|pos| list.remove(pos)))
            .is_some();
        if removed {
            lists.entry(dest_key.to_string()).or_default().push_back(new_json.to_string());
        }
        Ok(removed)
    }

    async fn schedule_delayed(
        &self,
        processing_key: &str,
        delayed_key: &str,
        old_json: &str,
        new_json: &str,
        _due_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let mut lists = self.lists.lock();
        let removed = lists
            .get_mut(processing_key)
            .and_then(|list| list.iter().position(|v| v == old_json).map(|pos| list.remove(pos)))
            .is_some();
        if removed {
            lists.entry(delayed_key.to_string()).or_default().push_back(new_json.to_string());
        }
        Ok(removed)
    }

    async fn promote_due_delayed(&self, delayed_key: &str, queue_key: &str) -> Result<u64> {
        let mut lists = self.lists.lock();
        let due: Vec<String> = lists.remove(delayed_key).unwrap_or_default().into();
        let n = due.len() as u64;
        let dest = lists.entry(queue_key.to_string()).or_default();
        for entry in due {
            dest.push_front(entry);
        }
        Ok(n)
    }

    async fn reap_processing_list(&self, processing_key: &str, queue_key: &str) -> Result<u64> {
        let mut lists = self.lists.lock();
        let Some(entries) = lists.remove(processing_key) else { return Ok(0) };
        let n = entries.len() as u64;
        let dest = lists.entry(queue_key.to_string()).or_default();
        for entry in entries {
            dest.push_back(entry);
        }
        Ok(n)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self.lists.lock().get(key).map(VecDeque::len).unwrap_or(0) as u64)
    }

    async fn set_heartbeat(&self, heartbeat_key: &str, _ttl: Duration) -> Result<()> {
        self.heartbeats.lock().insert(heartbeat_key.to_string());
        Ok(())
    }

    async fn heartbeat_is_stale(&self, heartbeat_key: &str) -> Result<bool> {
        Ok(!self.heartbeats.lock().contains(heartbeat_key))
    }

    async fn lrange(&self, key: &str, _start: i64, _stop: i64) -> Result<Vec<String>> {
        Ok(self.lists.lock().get(key).map(|l| l.iter().cloned().collect()).unwrap_or_default())
    }

    async fn purge_list(&self, key: &str) -> Result<u64> {
        Ok(self.lists.lock().remove(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn requeue_entry(&self, source_key: &str, dest_key: &str, old_json: &str, new_json: &str) -> Result<bool> {
        self.move_to_tail(source_key, dest_key, old_json, new_json).await
    }
}

/// An in-memory [`IdempotencyStore`] mirroring the Redis script's semantics exactly:
/// `check_and_reserve` is atomic because the whole store sits behind one mutex.
#[derive(Default)]
pub struct FakeIdempotencyStore {
    reserved: parking_lot::Mutex<HashSet<String>>,
    processed: AtomicU64,
    duplicates: AtomicU64,
}

#[async_trait]
impl IdempotencyStore for FakeIdempotencyStore {
    async fn check_and_reserve(&self, key: &str, _ttl: Duration) -> Result<IdempotencyOutcome> {
        let mut reserved = self.reserved.lock();
        if reserved.contains(key) {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
            Ok(IdempotencyOutcome::Duplicate)
        } else {
            reserved.insert(key.to_string());
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(IdempotencyOutcome::Reserved)
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.reserved.lock().remove(key);
        Ok(())
    }

    async fn confirm(&self, _key: &str, _retention: Duration) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<IdempotencyStats> {
        Ok(IdempotencyStats {
            processed: self.processed.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            active_keys: self.reserved.lock().len() as u64,
        })
    }
}
