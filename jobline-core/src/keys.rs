//! Redis key naming (§6). Centralized so every component that touches the store agrees on the
//! schema without coordination.

/// Key for a priority queue's job list, optionally tenant-scoped.
pub fn queue_key(tenant: Option<&str>, queue: &str) -> String {
    match tenant {
        Some(t) => format!("{t}:{queue}"),
        None => queue.to_string(),
    }
}

/// Key for a worker's processing (reservation) list.
pub fn processing_key(queue: &str, worker_id: &str) -> String {
    format!("{queue}:processing:{worker_id}")
}

/// Key for a queue's dead-letter list.
pub fn dlq_key(queue: &str) -> String {
    format!("{queue}:dlq")
}

/// Key for a single idempotency reservation.
pub fn idempotency_key(key: &str) -> String {
    format!("idempotency:key:{key}")
}

/// Key for the idempotency processed/duplicates counters hash.
pub fn idempotency_stats_key() -> &'static str {
    "idempotency:stats"
}

/// Key for a queue's token-bucket rate-limiter state.
pub fn rate_limit_key(queue: &str) -> String {
    format!("{queue}:ratelimit")
}

/// Key for a queue's delayed-retry ZSET (jobs scheduled for future redelivery).
pub fn delayed_key(queue: &str) -> String {
    format!("{queue}:delayed")
}

/// Key for a worker's liveness heartbeat on a given queue.
pub fn heartbeat_key(queue: &str, worker_id: &str) -> String {
    format!("{queue}:heartbeat:{worker_id}")
}
