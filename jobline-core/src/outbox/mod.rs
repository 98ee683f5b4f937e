//! Transactional outbox: business logic and event inserts share one transaction, a background
//! drain loop then publishes each pending event exactly once by composing with the idempotency
//! store (§4.4).

mod model;
mod processor;
mod store;

pub use model::{NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use processor::{OutboxProcessor, OutboxProcessorConfig};
pub use store::{OutboxStore, PostgresOutboxStore};
