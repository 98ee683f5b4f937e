//! Core library for Jobline: a Redis-backed distributed job queue with exactly-once admission,
//! a transactional outbox, and an automatic capacity planner.
//!
//! Every subsystem is a port (an `async_trait` defined here) plus a concrete Redis adapter, the
//! same split the rest of the codebase this crate grew out of draws between domain traits and
//! infrastructure.

pub mod error;
pub mod forecast;
pub mod idempotency;
pub mod keys;
pub mod model;
pub mod observability;
pub mod outbox;
pub mod planner;
pub mod queue;
pub mod queueing;

#[cfg(test)]
mod test_support;

pub use error::{QueueError, Result};
pub use forecast::MetricsSnapshot;
pub use idempotency::{IdempotencyOutcome, IdempotencyStats, IdempotencyStore, RedisIdempotencyStore};
pub use model::{JobEnvelope, JobId, PayloadRef, Priority, ReservationId, SpanId, TraceContext, TraceId};
pub use observability::{
    AlwaysReady, Metrics, MetricsRegistrar, QueueLengthSampler, ReadinessCheck, ReadinessGate, SamplerConfig,
    TracingConfig, dequeue_span, enqueue_span, extract_trace_context, init_tracing,
};
pub use outbox::{
    NewOutboxEvent, OutboxEvent, OutboxProcessor, OutboxProcessorConfig, OutboxStatus, OutboxStore,
    PostgresOutboxStore,
};
pub use planner::{CapacityPlan, CapacityPlanner, PlanRequest, PlannerConfig, Simulator, WhatIfScenario};
pub use queue::{
    Lease, NackDisposition, PrioritySelector, QueueRuntime, QueueSet, QueueStore, Reaper, ReaperConfig,
    RedisQueueStore, RuntimeConfig, TokenBucket, WatchedLease,
};
pub use queueing::{QueueModel, QueueingCalculator};
