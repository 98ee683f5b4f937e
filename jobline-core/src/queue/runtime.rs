//! Orchestrates Enqueue/Dequeue/Ack/Nack/Promote-to-DLQ against the store, rate limiter, and
//! idempotency store (§4.1, §6). This is the seam workers and HTTP handlers call into.

use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

use crate::error::{QueueError, Result};
use crate::idempotency::{IdempotencyOutcome, IdempotencyStore};
use crate::keys;
use crate::model::{JobEnvelope, Priority};
use crate::observability::{Metrics, dequeue_span, enqueue_span};
use crate::queue::backoff::full_jitter_delay;
use crate::queue::priority::{PrioritySelector, QueueSet};
use crate::queue::rate_limit::TokenBucket;
use crate::queue::store::QueueStore;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub tenant: Option<String>,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_retention: Duration,
    pub anti_starvation_p: f64,
    pub selector_seed: u64,
    /// Maximum `payload.file_size` an envelope may declare (§4.1: "fails with `InvalidPayload`
    /// if the payload violates any configured size limit"). `None` disables the check.
    pub max_payload_size: Option<u64>,
    /// Upper bound on a single per-candidate `BRPOPLPUSH` attempt inside [`QueueRuntime::dequeue`]
    /// (§4.1: the selector must reconsider priority order across the whole wait, not commit to
    /// one queue for the entire `timeout`).
    pub dequeue_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tenant: None,
            max_retries: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(300),
            idempotency_retention: Duration::from_secs(86_400),
            anti_starvation_p: 0.9,
            selector_seed: 0,
            max_payload_size: None,
            dequeue_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Outcome of a Dequeue call: the leased envelope plus the processing-list key it now lives on,
/// needed by [`QueueRuntime::ack`]/[`QueueRuntime::nack`] to address the right list entry.
pub struct Lease {
    pub envelope: JobEnvelope,
    pub queue_key: String,
    pub processing_key: String,
    /// Exact JSON string `BRPOPLPUSH` placed on the processing list, captured before trace
    /// adoption mutates `envelope` — `Ack`/`Nack` must `LREM` this exact value, not a
    /// re-serialization of the (now different) envelope.
    pub raw_json: String,
}

/// Disposition passed to [`QueueRuntime::nack`].
pub enum NackDisposition {
    /// Retryable failure: schedule redelivery after a full-jitter backoff, unless retries are
    /// already exhausted, in which case the envelope is promoted to the DLQ instead.
    Retry,
    /// Non-retryable failure: promote straight to the DLQ regardless of retry count.
    Fatal { reason: String },
}

pub struct QueueRuntime {
    store: Arc<dyn QueueStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    /// Rate limiters key off the same connection manager the store wraps — token-bucket state
    /// lives in Redis itself, so any connection to the same instance works.
    rate_limiters: HashMap<String, TokenBucket>,
    rate_limit_conn: Option<ConnectionManager>,
    selector: parking_lot::Mutex<PrioritySelector>,
    queues: QueueSet,
    config: RuntimeConfig,
    /// Queues currently marked draining (§4.1: `Enqueue` fails with `QueueClosed` against these).
    /// An operator-facing toggle, not persisted — restarting the process clears it, the same
    /// lifetime as the in-process rate limiter map.
    draining: parking_lot::RwLock<HashSet<String>>,
    metrics: Option<Arc<Metrics>>,
    /// Cooperative shutdown signal for [`Self::dequeue`]'s suspension point, grounded on the
    /// teacher's `OrchestratorRuntime::shutdown_token` (`ferrex-core/src/scan/orchestration/
    /// runtime/supervisor.rs`) — one shared, cloneable token every worker task observes, rather
    /// than a single-consumer `mpsc` channel that only one task could drain.
    shutdown: CancellationToken,
}

impl QueueRuntime {
    pub fn new(
        store: Arc<dyn QueueStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        queues: QueueSet,
        rate_limiters: HashMap<String, TokenBucket>,
        rate_limit_conn: Option<ConnectionManager>,
        config: RuntimeConfig,
    ) -> Self {
        let selector = PrioritySelector::new(config.anti_starvation_p, config.selector_seed);
        Self {
            store,
            idempotency,
            rate_limiters,
            rate_limit_conn,
            selector: parking_lot::Mutex::new(selector),
            queues,
            config,
            draining: parking_lot::RwLock::new(HashSet::new()),
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// A cloneable handle to the runtime's shutdown signal. Calling `.cancel()` on it (or on any
    /// clone) interrupts every in-flight and future [`Self::dequeue`] call: each returns
    /// `Err(QueueError::Interrupted)` without consuming an entry.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Attaches a metrics handle; counters (produced/retried/dead-lettered/failed) are only
    /// incremented when one is set, so tests that don't care about metrics can omit it.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Marks `queue` as draining: further `Enqueue` calls fail with `QueueClosed` until
    /// [`Self::resume`] is called. Jobs already enqueued are unaffected.
    pub fn drain(&self, queue: &str) {
        self.draining.write().insert(queue.to_string());
    }

    pub fn resume(&self, queue: &str) {
        self.draining.write().remove(queue);
    }

    pub fn is_draining(&self, queue: &str) -> bool {
        self.draining.read().contains(queue)
    }

    fn queue_key(&self, queue: &str) -> String {
        keys::queue_key(self.config.tenant.as_deref(), queue)
    }

    /// Admits a job onto `queue`, honoring the queue's rate limiter (if configured) and an
    /// optional idempotency key. `blocking` picks between `Enqueue` (waits up to `deadline` for
    /// a rate-limiter token) and `TryEnqueue` (one non-blocking attempt).
    pub async fn enqueue(
        &self,
        queue: &str,
        mut envelope: JobEnvelope,
        blocking: bool,
        deadline: Duration,
    ) -> Result<()> {
        envelope.validate()?;

        if let Some(limit) = self.config.max_payload_size {
            if envelope.payload.file_size > limit {
                return Err(QueueError::InvalidPayload(format!(
                    "payload size {} exceeds configured limit {limit}",
                    envelope.payload.file_size
                )));
            }
        }

        if self.is_draining(queue) {
            return Err(QueueError::QueueClosed(queue.to_string()));
        }

        if let Some(key) = envelope.idempotency_key.clone() {
            match self.idempotency.check_and_reserve(&key, self.config.idempotency_ttl).await? {
                IdempotencyOutcome::Duplicate => return Err(QueueError::Duplicate),
                IdempotencyOutcome::Reserved => {}
            }
        }

        // From here on, any failure must release the reservation taken above (if any) so the
        // caller can legitimately retry from scratch instead of being blocked until the TTL
        // expires (§4.2 `Release`: "used on failure paths to allow retries from scratch").
        let result = self.try_admit(queue, blocking, deadline, &mut envelope).await;
        if result.is_err() {
            if let Some(key) = &envelope.idempotency_key {
                if let Err(release_err) = self.idempotency.release(key).await {
                    warn!(error = %release_err, key, "failed to release idempotency reservation after enqueue failure");
                }
            }
            return result;
        }

        // Confirm happens at Ack time, once the job is actually processed (§4.1/§4.2) — not here,
        // since admission alone doesn't mean the job will ever be successfully processed.
        if let Some(metrics) = &self.metrics {
            metrics.jobs_produced.inc();
        }
        Ok(())
    }

    async fn try_admit(&self, queue: &str, blocking: bool, deadline: Duration, envelope: &mut JobEnvelope) -> Result<()> {
        if let (Some(limiter), Some(conn)) = (self.rate_limiters.get(queue), self.rate_limit_conn.as_ref()) {
            let mut conn = conn.clone();
            if blocking {
                limiter.acquire(&mut conn, deadline).await?;
            } else if !limiter.try_acquire(&mut conn).await? {
                return Err(QueueError::RateLimited(format!("queue {queue} rate limit exceeded")));
            }
        }

        let queue_key = self.queue_key(queue);
        let existing = Some(envelope.trace_context()).filter(|ctx| ctx.trace_id.is_some());
        let (span, stamped) = enqueue_span(&queue_key, envelope.priority, existing);
        envelope.trace_id = stamped.trace_id;
        envelope.span_id = stamped.span_id;
        let json = serde_json::to_string(&envelope)?;
        self.store.push_left(&queue_key, &json).instrument(span).await?;
        Ok(())
    }

    /// Blocking dequeue with anti-starvation priority selection across `queue` names registered
    /// in the runtime's [`QueueSet`]. `worker_id` identifies the processing list the lease lands
    /// on. Returns `Ok(None)` on timeout (empty across all classes) and
    /// `Err(QueueError::Interrupted)` if [`Self::shutdown_token`] is cancelled — either way, no
    /// entry is consumed.
    ///
    /// Re-derives the candidate set from real `LLEN`s at most every
    /// `config.dequeue_poll_interval`, so the selector never commits to one queue (via a single
    /// full-`timeout` `BRPOPLPUSH`) while a different, non-chosen queue already has jobs ready
    /// (§4.1 Dequeue's priority-policy contract).
    pub async fn dequeue(&self, worker_id: &str, timeout: Duration) -> Result<Option<Lease>> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(QueueError::Interrupted);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let mut empty = HashSet::new();
            for name in self.queues.all_queues() {
                let key = self.queue_key(name);
                if self.store.list_len(&key).await? == 0 {
                    empty.insert(name.clone());
                }
            }

            let chosen = {
                let mut selector = self.selector.lock();
                selector.select(&self.queues, |name| empty.contains(name))
            };

            let Some(queue) = chosen else {
                // Every candidate looked empty in this snapshot. Back off briefly and
                // reconsider rather than blocking indefinitely on a stale emptiness read.
                let nap = self.config.dequeue_poll_interval.min(remaining);
                tokio::select! {
                    () = self.shutdown.cancelled() => return Err(QueueError::Interrupted),
                    () = tokio::time::sleep(nap) => continue,
                }
            };

            let queue_key = self.queue_key(&queue);
            let processing_key = keys::processing_key(&queue_key, worker_id);
            let poll_timeout = self.config.dequeue_poll_interval.min(remaining);

            let wait_span = info_span!("dequeue_wait", queue = %queue_key, worker_id = %worker_id);
            let raw = tokio::select! {
                () = self.shutdown.cancelled() => return Err(QueueError::Interrupted),
                result = self
                    .store
                    .dequeue_blocking(&queue_key, &processing_key, poll_timeout)
                    .instrument(wait_span) => result?,
            };

            let Some(raw) = raw else {
                // The chosen queue emptied out between our `LLEN` probe and the blocking pop
                // (or another worker won the race) — loop and let the selector reconsider.
                continue;
            };

            let mut envelope: JobEnvelope = serde_json::from_str(&raw)?;
            let (span, adopted) = dequeue_span(&queue_key, envelope.priority, envelope.trace_context());
            let _entered = span.enter();
            envelope = envelope.with_trace(adopted);

            return Ok(Some(Lease {
                envelope,
                queue_key,
                processing_key,
                raw_json: raw,
            }));
        }
    }

    /// Marks a lease as successfully processed, removing it from the processing list and
    /// confirming (not releasing) the idempotency reservation held for it — only now, with the
    /// job actually processed, does the reservation graduate from "admitted" to "done".
    pub async fn ack(&self, lease: &Lease) -> Result<()> {
        let removed = self
            .store
            .remove_from_processing(&lease.processing_key, &lease.raw_json)
            .await?;
        if removed {
            if let Some(key) = &lease.envelope.idempotency_key {
                self.idempotency.confirm(key, self.config.idempotency_retention).await?;
            }
        }
        Ok(())
    }

    /// Applies a Nack disposition: `Retry` schedules a full-jitter-delayed redelivery unless
    /// retries are exhausted (then promotes to DLQ); `Fatal` always promotes to DLQ.
    pub async fn nack(&self, lease: &Lease, disposition: NackDisposition) -> Result<()> {
        let original_json = lease.raw_json.as_str();
        let mut next = lease.envelope.clone();
        next.retries += 1;

        let fatal_reason = match disposition {
            NackDisposition::Fatal { reason } => Some(reason),
            NackDisposition::Retry if next.retries > self.config.max_retries => {
                Some(format!("max retries ({}) exceeded", self.config.max_retries))
            }
            NackDisposition::Retry => None,
        };

        if let Some(metrics) = &self.metrics {
            metrics.jobs_failed.inc();
        }

        if let Some(reason) = fatal_reason {
            let dlq_key = keys::dlq_key(&lease.queue_key);
            let record = serde_json::json!({
                "envelope": next,
                "reason": reason,
                "dead_lettered_at": Utc::now(),
            });
            let record_json = serde_json::to_string(&record)?;
            let moved = self
                .store
                .move_to_tail(&lease.processing_key, &dlq_key, original_json, &record_json)
                .await?;
            if !moved {
                warn!(queue = %lease.queue_key, "nack: envelope already absent from processing list");
            } else if let Some(metrics) = &self.metrics {
                metrics.jobs_dead_lettered.inc();
            }
            return Ok(());
        }

        let delay = full_jitter_delay(self.config.backoff_base, self.config.backoff_max, next.retries);
        let due_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let delayed_key = keys::delayed_key(&lease.queue_key);
        let next_json = serde_json::to_string(&next)?;
        let rescheduled = self
            .store
            .schedule_delayed(&lease.processing_key, &delayed_key, original_json, &next_json, due_at)
            .await?;
        if rescheduled {
            if let Some(metrics) = &self.metrics {
                metrics.jobs_retried.inc();
            }
        }
        Ok(())
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.store.list_len(&self.queue_key(queue)).await
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn priority_of(&self, queue: &str) -> Option<Priority> {
        Priority::ALL.into_iter().find(|p| self.queues.queues_for(*p).iter().any(|q| q == queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyStats;
    use crate::model::PayloadRef;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// An in-memory [`QueueStore`] fake, standing in for Redis the same way the teacher's
    /// repository-trait tests swap a Postgres adapter for an in-memory one — every list is a
    /// plain `VecDeque<String>` guarded by one mutex.
    #[derive(Default)]
    struct FakeQueueStore {
        lists: parking_lot::Mutex<HashMap<String, VecDeque<String>>>,
        heartbeats: parking_lot::Mutex<HashSet<String>>,
        fail_push: std::sync::atomic::AtomicBool,
    }

    impl FakeQueueStore {
        fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl QueueStore for FakeQueueStore {
        async fn push_left(&self, queue_key: &str, envelope_json: &str) -> Result<()> {
            if self.fail_push.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(QueueError::Unavailable("simulated store outage".into()));
            }
            self.lists.lock().entry(queue_key.to_string()).or_default().push_front(envelope_json.to_string());
            Ok(())
        }

        async fn dequeue_blocking(
            &self,
            queue_key: &str,
            processing_key: &str,
            _timeout: Duration,
        ) -> Result<Option<String>> {
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
            _due_at: chrono::DateTime<Utc>,
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
            let due: Vec<String> = lists.get_mut(delayed_key).map(std::mem::take).unwrap_or_default().into();
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

    /// An in-memory [`IdempotencyStore`] fake mirroring the Redis script's semantics exactly:
    /// `check_and_reserve` is atomic because the whole store is behind one mutex.
    #[derive(Default)]
    struct FakeIdempotencyStore {
        reserved: parking_lot::Mutex<HashSet<String>>,
        processed: std::sync::atomic::AtomicU64,
        duplicates: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl IdempotencyStore for FakeIdempotencyStore {
        async fn check_and_reserve(&self, key: &str, _ttl: Duration) -> Result<IdempotencyOutcome> {
            let mut reserved = self.reserved.lock();
            if reserved.contains(key) {
                self.duplicates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(IdempotencyOutcome::Duplicate)
            } else {
                reserved.insert(key.to_string());
                self.processed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
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
                processed: self.processed.load(std::sync::atomic::Ordering::SeqCst),
                duplicates: self.duplicates.load(std::sync::atomic::Ordering::SeqCst),
                active_keys: self.reserved.lock().len() as u64,
            })
        }
    }

    fn test_runtime(store: Arc<FakeQueueStore>, idempotency: Arc<FakeIdempotencyStore>, config: RuntimeConfig) -> QueueRuntime {
        let mut queues = QueueSet::new();
        queues.insert(Priority::Medium, "orders");
        QueueRuntime::new(store, idempotency, queues, HashMap::new(), None, config)
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack_leaves_no_residue() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let runtime = test_runtime(store.clone(), idempotency, RuntimeConfig::default());

        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium);
        runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap();
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);

        let lease = runtime.dequeue("w1", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 0);

        runtime.ack(&lease).await.unwrap();
        assert_eq!(store.list_len(&lease.processing_key).await.unwrap(), 0);
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected_without_touching_the_queue() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let runtime = test_runtime(store, idempotency.clone(), RuntimeConfig::default());

        let key = "k-2025-01-14-abc";
        let first = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium).with_idempotency_key(key);
        let second = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium).with_idempotency_key(key);

        runtime.enqueue("orders", first, true, Duration::from_millis(10)).await.unwrap();
        let err = runtime.enqueue("orders", second, true, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, QueueError::Duplicate));

        let stats = idempotency.stats().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_failure_after_reservation_releases_the_key_for_a_clean_retry() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let runtime = test_runtime(store.clone(), idempotency.clone(), RuntimeConfig::default());

        store.fail_push.store(true, std::sync::atomic::Ordering::SeqCst);
        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium).with_idempotency_key("k1");
        let err = runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));

        // The reservation from the failed attempt must have been released — a retry under the
        // same key, once the store recovers, is treated as a fresh admission, not a Duplicate.
        assert_eq!(idempotency.stats().await.unwrap().active_keys, 0);
        store.fail_push.store(false, std::sync::atomic::Ordering::SeqCst);
        let retry = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium).with_idempotency_key("k1");
        runtime.enqueue("orders", retry, true, Duration::from_millis(10)).await.unwrap();
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn payload_exceeding_the_configured_limit_is_rejected() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let config = RuntimeConfig {
            max_payload_size: Some(10),
            ..RuntimeConfig::default()
        };
        let runtime = test_runtime(store, idempotency, config);

        let envelope = JobEnvelope::new(PayloadRef::new("x", 11), Priority::Medium);
        let err = runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn draining_queue_rejects_enqueue_and_resume_lifts_it() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let runtime = test_runtime(store, idempotency, RuntimeConfig::default());

        runtime.drain("orders");
        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium);
        assert!(matches!(
            runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await,
            Err(QueueError::QueueClosed(_))
        ));

        runtime.resume("orders");
        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium);
        runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap();
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nack_retry_reschedules_with_incremented_retries() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let runtime = test_runtime(store.clone(), idempotency, RuntimeConfig::default());

        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium);
        runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap();
        let lease = runtime.dequeue("w1", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(lease.envelope.retries, 0);

        runtime.nack(&lease, NackDisposition::Retry).await.unwrap();
        assert_eq!(store.list_len(&lease.processing_key).await.unwrap(), 0);

        let delayed_key = keys::delayed_key(&lease.queue_key);
        let delayed = store.lrange(&delayed_key, 0, -1).await.unwrap();
        assert_eq!(delayed.len(), 1);
        let rescheduled: JobEnvelope = serde_json::from_str(&delayed[0]).unwrap();
        assert_eq!(rescheduled.retries, 1);
    }

    #[tokio::test]
    async fn nack_retry_past_max_retries_promotes_to_dlq() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let config = RuntimeConfig {
            max_retries: 0,
            ..RuntimeConfig::default()
        };
        let runtime = test_runtime(store.clone(), idempotency, config);

        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium);
        runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap();
        let lease = runtime.dequeue("w1", Duration::from_millis(10)).await.unwrap().unwrap();

        runtime.nack(&lease, NackDisposition::Retry).await.unwrap();

        let dlq_key = keys::dlq_key(&lease.queue_key);
        let dlq = store.lrange(&dlq_key, 0, -1).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(store.list_len(&lease.processing_key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_fatal_promotes_straight_to_dlq_regardless_of_retries() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let runtime = test_runtime(store.clone(), idempotency, RuntimeConfig::default());

        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Medium);
        runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap();
        let lease = runtime.dequeue("w1", Duration::from_millis(10)).await.unwrap().unwrap();

        runtime
            .nack(&lease, NackDisposition::Fatal { reason: "poison pill".to_string() })
            .await
            .unwrap();

        let dlq_key = keys::dlq_key(&lease.queue_key);
        let dlq = store.lrange(&dlq_key, 0, -1).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert!(dlq[0].contains("poison pill"));
    }

    #[tokio::test]
    async fn dequeue_falls_through_to_a_ready_lower_priority_queue_when_the_higher_one_is_empty() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let mut queues = QueueSet::new();
        queues.insert(Priority::Critical, "urgent");
        queues.insert(Priority::Low, "bulk");
        let runtime = QueueRuntime::new(store, idempotency, queues, HashMap::new(), None, RuntimeConfig::default());

        let envelope = JobEnvelope::new(PayloadRef::new("x", 1), Priority::Low);
        runtime.enqueue("bulk", envelope, true, Duration::from_millis(10)).await.unwrap();

        // Before the fix, the selector was told every queue is non-empty and could pick
        // "urgent" — empty — committing the whole blocking pop to a queue with nothing in it
        // and returning `None` even though "bulk" has a job ready.
        let lease = runtime
            .dequeue("w1", Duration::from_millis(200))
            .await
            .unwrap()
            .expect("the ready job in the lower-priority queue must be found");
        assert_eq!(runtime.queue_depth("bulk").await.unwrap(), 0);
        assert_eq!(lease.envelope.payload.file_path, "x");
    }

    #[tokio::test]
    async fn dequeue_returns_interrupted_on_cancellation_without_consuming_an_entry() {
        let store = Arc::new(FakeQueueStore::new());
        let idempotency = Arc::new(FakeIdempotencyStore::default());
        let config = RuntimeConfig {
            dequeue_poll_interval: Duration::from_millis(10),
            ..RuntimeConfig::default()
        };
        let runtime = Arc::new(test_runtime(store, idempotency, config));
        let token = runtime.shutdown_token();

        let worker = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.dequeue("w1", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let result = worker.await.unwrap();
        assert!(matches!(result, Err(QueueError::Interrupted)));
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 0);
    }
}
