//! OTLP tracing pipeline init and the enqueue/dequeue span helpers that stamp/adopt a job's
//! carried trace context (§4.8 "Tracing").

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::error::{QueueError, Result};
use crate::model::{Priority, SpanId, TraceContext, TraceId};

/// One of the four sampling strategies §4.8 names.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingStrategy {
    Always,
    Never,
    Probabilistic { ratio: f64 },
    ParentBased,
}

#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub sampling: SamplingStrategy,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: None,
            service_name: "jobline".to_string(),
            sampling: SamplingStrategy::ParentBased,
        }
    }
}

fn sampler_for(strategy: SamplingStrategy) -> Sampler {
    match strategy {
        SamplingStrategy::Always => Sampler::AlwaysOn,
        SamplingStrategy::Never => Sampler::AlwaysOff,
        SamplingStrategy::Probabilistic { ratio } => Sampler::TraceIdRatioBased(ratio.clamp(0.0, 1.0)),
        SamplingStrategy::ParentBased => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
    }
}

/// Installs the global `tracing` subscriber (env-filter + fmt layer, matching the teacher's
/// `main.rs` convention), layering in an OTLP exporter and the trace-context+baggage composite
/// propagator when `config.enabled` and an endpoint is configured. Returns the tracer provider so
/// the caller can shut it down cleanly at process exit.
pub fn init_tracing(config: &TracingConfig) -> Result<Option<SdkTracerProvider>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let provider = match (config.enabled, &config.otlp_endpoint) {
        (true, Some(endpoint)) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .map_err(|e| QueueError::Internal(format!("otlp exporter init failed: {e}")))?;

            let resource = Resource::builder().with_service_name(config.service_name.clone()).build();

            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_sampler(sampler_for(config.sampling))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource)
                .build();

            global::set_tracer_provider(provider.clone());
            global::set_text_map_propagator(composite_propagator());
            Some(provider)
        }
        _ => None,
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| OpenTelemetryLayer::new(p.tracer(config.service_name.clone())));

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| QueueError::Internal(format!("tracing subscriber already initialized: {e}")))?;

    Ok(provider)
}

/// `trace-context` + `baggage` composite propagator (§4.8).
fn composite_propagator() -> impl opentelemetry::propagation::TextMapPropagator {
    use opentelemetry::propagation::TextMapCompositePropagator;
    use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

    TextMapCompositePropagator::new(vec![Box::new(TraceContextPropagator::new()), Box::new(BaggagePropagator::new())])
}

/// Opens the enqueue span named after `queue`, with `queue`/`priority` attributes, and returns a
/// fresh or carried-forward [`TraceContext`] to stamp onto the outgoing envelope (§4.8: "enqueue
/// spans stamp trace/span IDs into the outgoing envelope").
pub fn enqueue_span(queue: &str, priority: Priority, existing: Option<TraceContext>) -> (Span, TraceContext) {
    let ctx = existing.filter(TraceContext::is_valid).unwrap_or_else(TraceContext::new_root);
    let span = tracing::info_span!(
        "enqueue",
        queue = %queue,
        priority = %priority,
        trace_id = %ctx.trace_id.map(|t| t.to_string()).unwrap_or_default(),
        span_id = %ctx.span_id.map(|s| s.to_string()).unwrap_or_default(),
    );
    (span, ctx)
}

/// Opens the dequeue span, adopting the envelope's carried trace context as a parent when both
/// fields parse as valid hex of the expected width, otherwise rooting a new trace. The returned
/// span's own id is always different from the parent's (§8 round-trip property).
pub fn dequeue_span(queue: &str, priority: Priority, carried: TraceContext) -> (Span, TraceContext) {
    let adopted = if carried.is_valid() && carried.trace_id.is_some() {
        carried.child_span()
    } else {
        TraceContext::new_root()
    };
    let span = tracing::info_span!(
        "dequeue",
        queue = %queue,
        priority = %priority,
        trace_id = %adopted.trace_id.map(|t| t.to_string()).unwrap_or_default(),
        span_id = %adopted.span_id.map(|s| s.to_string()).unwrap_or_default(),
        parent_span_id = %carried.span_id.map(|s| s.to_string()).unwrap_or_default(),
    );
    (span, adopted)
}

/// Parses the wire-format trace/span hex strings (`""` meaning absent) into a [`TraceContext`],
/// as a consumer would when re-rooting its own span from an envelope read off the wire.
pub fn extract_trace_context(trace_id_hex: &str, span_id_hex: &str) -> TraceContext {
    match (TraceId::parse(trace_id_hex), SpanId::parse(span_id_hex)) {
        (Ok(t), Ok(s)) => TraceContext {
            trace_id: Some(t),
            span_id: Some(s),
        },
        _ => TraceContext::none(),
    }
}
