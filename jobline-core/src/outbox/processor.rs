//! Background drain loop: pulls a batch of pending events in creation order and publishes each
//! exactly once by gating the enqueue through the idempotency store (§4.4).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::idempotency::{ContentHashKeyGenerator, IdempotencyKeyGenerator};
use crate::model::{JobEnvelope, PayloadRef, Priority};
use crate::outbox::store::OutboxStore;
use crate::queue::QueueRuntime;

#[derive(Clone, Debug)]
pub struct OutboxProcessorConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: u32,
    pub publish_priority: Priority,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_attempts: 5,
            publish_priority: Priority::Medium,
        }
    }
}

/// Single-writer drain loop — only one instance should run per outbox table at a time; multiple
/// processors still coordinate safely because [`OutboxStore::claim_pending_batch`] durably leases
/// each row it claims (not just a `SKIP LOCKED` select that releases its lock at commit), but
/// running more than one defeats the "same-target events publish in creation order" ordering
/// guarantee from §4.4.
pub struct OutboxProcessor {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl OutboxProcessor {
    pub fn spawn(store: Arc<dyn OutboxStore>, runtime: Arc<QueueRuntime>, config: OutboxProcessorConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let keygen = ContentHashKeyGenerator::default();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.poll_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("outbox processor shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        Self::drain_once(&store, &runtime, &keygen, &config).await;
                    }
                }
            }
        });

        Self { handle, shutdown_tx }
    }

    async fn drain_once(
        store: &Arc<dyn OutboxStore>,
        runtime: &Arc<QueueRuntime>,
        keygen: &ContentHashKeyGenerator,
        config: &OutboxProcessorConfig,
    ) {
        let batch = match store.claim_pending_batch(config.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "outbox: failed to claim pending batch");
                return;
            }
        };

        for event in batch {
            let idempotency_key = keygen.generate(event.id.as_bytes());
            let payload_bytes = serde_json::to_vec(&event.payload).unwrap_or_default();
            let envelope = JobEnvelope::new(
                PayloadRef::new(format!("outbox:{}", event.id), payload_bytes.len() as u64),
                config.publish_priority,
            )
            .with_idempotency_key(idempotency_key);

            let outcome = runtime
                .enqueue(&event.queue_name, envelope, false, Duration::from_millis(50))
                .await;

            match outcome {
                Ok(()) => {
                    if let Err(err) = store.mark_processed(event.id).await {
                        warn!(error = %err, event_id = %event.id, "outbox: failed to mark processed");
                    }
                }
                Err(crate::error::QueueError::Duplicate) => {
                    // Already admitted under this idempotency key by an earlier, crashed drain
                    // attempt — treat as success per §4.4 step 2.
                    if let Err(err) = store.mark_processed(event.id).await {
                        warn!(error = %err, event_id = %event.id, "outbox: failed to mark duplicate as processed");
                    }
                }
                Err(err) => {
                    warn!(error = %err, event_id = %event.id, "outbox: publish failed");
                    if let Err(mark_err) = store.mark_failed(event.id, &err.to_string(), config.max_attempts).await {
                        warn!(error = %mark_err, event_id = %event.id, "outbox: failed to record failed attempt");
                    }
                }
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::model::Priority;
    use crate::outbox::model::{OutboxEvent, OutboxStatus};
    use crate::queue::priority::QueueSet;
    use crate::queue::runtime::RuntimeConfig;
    use crate::outbox::store::CLAIM_LEASE_SECONDS;
    use crate::test_support::{FakeIdempotencyStore, FakeQueueStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use uuid::Uuid;

    /// An in-memory [`OutboxStore`], standing in for Postgres the way [`FakeQueueStore`] stands
    /// in for Redis. `claimed` mirrors the real store's `claimed_at` lease column: a row picked
    /// by `claim_pending_batch` is marked claimed *before* the call returns, so a second call
    /// (same process or a simulated concurrent processor) cannot re-select it until the lease
    /// expires — reproducing the durable-claim contract the real `UPDATE ... RETURNING` gives.
    #[derive(Default)]
    struct FakeOutboxStore {
        events: Mutex<Vec<OutboxEvent>>,
        claimed: Mutex<HashMap<Uuid, chrono::DateTime<Utc>>>,
    }

    impl FakeOutboxStore {
        fn seed(&self, event: OutboxEvent) {
            self.events.lock().push(event);
        }

        fn get(&self, id: Uuid) -> OutboxEvent {
            self.events.lock().iter().find(|e| e.id == id).cloned().unwrap()
        }
    }

    #[async_trait]
    impl OutboxStore for FakeOutboxStore {
        async fn claim_pending_batch(&self, batch_size: i64) -> Result<Vec<OutboxEvent>> {
            let events = self.events.lock();
            let mut claimed = self.claimed.lock();
            let now = Utc::now();
            let lease = chrono::Duration::seconds(CLAIM_LEASE_SECONDS);

            let mut pending: Vec<OutboxEvent> = events
                .iter()
                .filter(|e| {
                    e.status == OutboxStatus::Pending
                        && claimed.get(&e.id).is_none_or(|claimed_at| now - *claimed_at >= lease)
                })
                .cloned()
                .collect();
            pending.sort_by_key(|e| e.created_at);
            pending.truncate(batch_size.max(0) as usize);

            for event in &pending {
                claimed.insert(event.id, now);
            }
            Ok(pending)
        }

        async fn mark_processed(&self, id: Uuid) -> Result<()> {
            let mut events = self.events.lock();
            if let Some(event) = events.iter_mut().find(|e| e.id == id) {
                event.status = OutboxStatus::Processed;
                event.processed_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn mark_failed(&self, id: Uuid, error: &str, max_attempts: u32) -> Result<()> {
            let mut events = self.events.lock();
            if let Some(event) = events.iter_mut().find(|e| e.id == id) {
                event.attempts += 1;
                event.last_error = Some(error.to_string());
                if event.attempts as u32 >= max_attempts {
                    event.status = OutboxStatus::Failed;
                }
            }
            Ok(())
        }
    }

    fn new_event(queue_name: &str, payload: serde_json::Value) -> OutboxEvent {
        OutboxEvent {
            id: Uuid::now_v7(),
            queue_name: queue_name.to_string(),
            payload,
            created_at: Utc::now(),
            processed_at: None,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    fn test_runtime() -> Arc<QueueRuntime> {
        let mut queues = QueueSet::new();
        queues.insert(Priority::Medium, "orders");
        Arc::new(QueueRuntime::new(
            Arc::new(FakeQueueStore::new()),
            Arc::new(FakeIdempotencyStore::default()),
            queues,
            HashMap::new(),
            None,
            RuntimeConfig::default(),
        ))
    }

    #[tokio::test]
    async fn drains_a_pending_event_onto_its_target_queue_and_marks_it_processed() {
        let store = Arc::new(FakeOutboxStore::default());
        let runtime = test_runtime();
        let keygen = ContentHashKeyGenerator::default();
        let config = OutboxProcessorConfig::default();

        let event = new_event("orders", serde_json::json!({"order_id": 42}));
        let id = event.id;
        store.seed(event);
        let dyn_store: Arc<dyn OutboxStore> = store.clone();

        OutboxProcessor::drain_once(&dyn_store, &runtime, &keygen, &config).await;

        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);
        assert_eq!(store.get(id).status, OutboxStatus::Processed);
        assert!(store.get(id).processed_at.is_some());

        // Re-running drain is a no-op: the event is no longer pending.
        OutboxProcessor::drain_once(&dyn_store, &runtime, &keygen, &config).await;
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn a_duplicate_idempotency_key_from_a_crashed_attempt_still_counts_as_processed() {
        let store = Arc::new(FakeOutboxStore::default());
        let runtime = test_runtime();
        let keygen = ContentHashKeyGenerator::default();
        let config = OutboxProcessorConfig::default();

        let event = new_event("orders", serde_json::json!({"order_id": 7}));
        let id = event.id;
        // Pre-admit the exact key the processor will derive for this event, simulating a prior
        // drain that enqueued the job but crashed before marking the row processed.
        let idempotency_key = keygen.generate(id.as_bytes());
        let envelope = JobEnvelope::new(PayloadRef::new(format!("outbox:{id}"), 3), Priority::Medium)
            .with_idempotency_key(idempotency_key);
        runtime.enqueue("orders", envelope, true, Duration::from_millis(10)).await.unwrap();

        store.seed(event);
        let dyn_store: Arc<dyn OutboxStore> = store.clone();
        OutboxProcessor::drain_once(&dyn_store, &runtime, &keygen, &config).await;

        // Still exactly one copy on the queue, and the row is marked processed rather than
        // endlessly retried.
        assert_eq!(runtime.queue_depth("orders").await.unwrap(), 1);
        assert_eq!(store.get(id).status, OutboxStatus::Processed);
    }

    #[tokio::test]
    async fn a_publish_failure_records_the_attempt_and_leaves_the_row_pending_under_the_ceiling() {
        let store = Arc::new(FakeOutboxStore::default());
        let runtime = test_runtime();
        runtime.drain("orders"); // force every publish attempt to fail with QueueClosed
        let keygen = ContentHashKeyGenerator::default();
        let config = OutboxProcessorConfig {
            max_attempts: 3,
            ..OutboxProcessorConfig::default()
        };

        let event = new_event("orders", serde_json::json!({"order_id": 99}));
        let id = event.id;
        store.seed(event);
        let dyn_store: Arc<dyn OutboxStore> = store.clone();

        OutboxProcessor::drain_once(&dyn_store, &runtime, &keygen, &config).await;

        let row = store.get(id);
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 1);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn a_publish_failure_past_max_attempts_marks_the_row_failed() {
        let store = Arc::new(FakeOutboxStore::default());
        let runtime = test_runtime();
        runtime.drain("orders");
        let keygen = ContentHashKeyGenerator::default();
        let config = OutboxProcessorConfig {
            max_attempts: 1,
            ..OutboxProcessorConfig::default()
        };

        let event = new_event("orders", serde_json::json!({"order_id": 100}));
        let id = event.id;
        store.seed(event);
        let dyn_store: Arc<dyn OutboxStore> = store.clone();

        OutboxProcessor::drain_once(&dyn_store, &runtime, &keygen, &config).await;

        assert_eq!(store.get(id).status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn a_claimed_row_is_not_reselected_by_a_concurrent_claim_before_it_is_marked() {
        let store = Arc::new(FakeOutboxStore::default());
        let event = new_event("orders", serde_json::json!({"order_id": 1}));
        let id = event.id;
        store.seed(event);

        // First claim: the row is still `pending` (it is only marked processed/failed after
        // publishing), but a durable claim must keep a second, concurrent claim from picking it
        // up again before that happens.
        let first = store.claim_pending_batch(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, id);

        let second = store.claim_pending_batch(10).await.unwrap();
        assert!(second.is_empty(), "row was re-claimed while still pending and unmarked");
    }
}
