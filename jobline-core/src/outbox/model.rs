//! Outbox event model (§3, §4.4, §6 persisted state layout).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `processed` always carries a non-null `processed_at`; `failed` is reached only once
/// `attempts` meets the configured ceiling without ever having reached `processed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

/// A row as persisted in the producer's transactional store.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// What a caller supplies to append a new event inside [`super::OutboxStore::execute_with_outbox`].
#[derive(Clone, Debug)]
pub struct NewOutboxEvent {
    pub queue_name: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new(queue_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload,
        }
    }
}
