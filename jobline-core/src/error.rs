//! Crate-wide error type and the [`Result`] alias used by every public operation.

use thiserror::Error;

/// Every fallible outcome a queue, idempotency, outbox, or planner operation can produce.
///
/// Variant names mirror the error kinds enumerated by the operational surface: producers and
/// workers match on these to decide whether to retry, surface to an operator, or treat as
/// success (`Duplicate`).
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("duplicate idempotency key")]
    Duplicate,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("planner cooldown active until {retry_after_secs}s from now")]
    CooldownActive { retry_after_secs: u64 },

    #[error("anomaly detected in recent metrics: {0}")]
    AnomalyDetected(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("data store unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded (request {request_id})")]
    DeadlineExceeded { request_id: String },

    #[error("operation interrupted")]
    Interrupted,

    #[error("queue is draining: {0}")]
    QueueClosed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl QueueError {
    /// True for errors a caller should retry after a bounded backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::RateLimited(_)
                | QueueError::CooldownActive { .. }
                | QueueError::AnomalyDetected(_)
                | QueueError::Unavailable(_)
                | QueueError::Redis(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QueueError>;
