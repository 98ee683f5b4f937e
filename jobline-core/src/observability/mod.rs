//! Metrics, readiness gating, the queue-length sampler, and OTLP tracing (§4.8).

mod metrics;
mod readiness;
mod sampler;
mod tracing_spine;

pub use metrics::{Metrics, MetricsRegistrar};
pub use readiness::{AlwaysReady, ReadinessCheck, ReadinessGate};
pub use sampler::{QueueLengthSampler, SamplerConfig};
pub use tracing_spine::{
    SamplingStrategy, TracingConfig, dequeue_span, enqueue_span, extract_trace_context, init_tracing,
};
