//! Metrics catalogue and the registration discipline that keeps it test-isolatable (§4.8, §9
//! "global metrics state" design note).

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::error::{QueueError, Result};

/// Binds [`Metrics`] to a registry. Production binds once to the process-wide default registry
/// (`prometheus::default_registry()`); tests construct a fresh [`Registry`] per test so repeated
/// runs registering the same collector name never panic and never leak state between tests.
pub struct MetricsRegistrar {
    registry: Registry,
}

impl MetricsRegistrar {
    /// Binds to the process-wide default registry. Call once at process startup.
    pub fn production() -> Self {
        Self {
            registry: prometheus::default_registry().clone(),
        }
    }

    /// A fresh, isolated registry — one per test, so collector registration never collides with
    /// another test or with a prior run in the same process.
    pub fn test_isolated() -> Self {
        Self { registry: Registry::new() }
    }

    /// Picks [`Self::test_isolated`] or [`Self::production`] based on the `METRICS_ENABLED`-style
    /// toggle (§6 environment variables; here inverted to "isolate from the default registry").
    pub fn from_toggle(test_isolated: bool) -> Self {
        if test_isolated {
            Self::test_isolated()
        } else {
            Self::production()
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// The catalogue in §4.8: six counters, one histogram, one queue-length gauge vector, a
/// breaker-state gauge, a breaker-trip counter, a reaper-recovery counter, and an active-workers
/// gauge.
#[derive(Clone)]
pub struct Metrics {
    pub jobs_produced: IntCounter,
    pub jobs_consumed: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub jobs_retried: IntCounter,
    pub jobs_dead_lettered: IntCounter,
    pub job_duration_seconds: Histogram,
    pub queue_length: IntGaugeVec,
    /// 0 = closed, 1 = half-open, 2 = open — the three-state circuit-breaker encoding §4.8 calls
    /// for.
    pub breaker_state: IntGauge,
    pub breaker_trips_total: IntCounter,
    pub reaper_recoveries_total: IntCounter,
    pub active_workers: IntGauge,
}

impl Metrics {
    /// Constructs and registers every collector against `registry`. A collector name already
    /// registered (e.g. a second [`Metrics::new`] call against the same production registry) is
    /// treated as success, not an error — the registration discipline this crate promises.
    pub fn new(registry: &Registry) -> Result<Self> {
        let jobs_produced = IntCounter::with_opts(Opts::new("jobline_jobs_produced_total", "Jobs enqueued"))?;
        let jobs_consumed = IntCounter::with_opts(Opts::new("jobline_jobs_consumed_total", "Jobs dequeued"))?;
        let jobs_completed = IntCounter::with_opts(Opts::new("jobline_jobs_completed_total", "Jobs acked"))?;
        let jobs_failed = IntCounter::with_opts(Opts::new("jobline_jobs_failed_total", "Jobs nacked"))?;
        let jobs_retried = IntCounter::with_opts(Opts::new("jobline_jobs_retried_total", "Jobs rescheduled after a retryable nack"))?;
        let jobs_dead_lettered =
            IntCounter::with_opts(Opts::new("jobline_jobs_dead_lettered_total", "Jobs promoted to the DLQ"))?;
        let job_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("jobline_job_duration_seconds", "Time spent processing a job between dequeue and ack/nack")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let queue_length = IntGaugeVec::new(
            Opts::new("jobline_queue_length", "Current list length, keyed by queue name"),
            &["queue"],
        )?;
        let breaker_state = IntGauge::with_opts(Opts::new(
            "jobline_circuit_breaker_state",
            "Circuit breaker state: 0=closed, 1=half-open, 2=open",
        ))?;
        let breaker_trips_total =
            IntCounter::with_opts(Opts::new("jobline_circuit_breaker_trips_total", "Times the breaker tripped open"))?;
        let reaper_recoveries_total = IntCounter::with_opts(Opts::new(
            "jobline_reaper_recoveries_total",
            "Envelopes returned to a queue by the reaper",
        ))?;
        let active_workers = IntGauge::with_opts(Opts::new("jobline_active_workers", "Currently running worker tasks"))?;

        try_register(registry, jobs_produced.clone())?;
        try_register(registry, jobs_consumed.clone())?;
        try_register(registry, jobs_completed.clone())?;
        try_register(registry, jobs_failed.clone())?;
        try_register(registry, jobs_retried.clone())?;
        try_register(registry, jobs_dead_lettered.clone())?;
        try_register(registry, job_duration_seconds.clone())?;
        try_register(registry, queue_length.clone())?;
        try_register(registry, breaker_state.clone())?;
        try_register(registry, breaker_trips_total.clone())?;
        try_register(registry, reaper_recoveries_total.clone())?;
        try_register(registry, active_workers.clone())?;

        Ok(Self {
            jobs_produced,
            jobs_consumed,
            jobs_completed,
            jobs_failed,
            jobs_retried,
            jobs_dead_lettered,
            job_duration_seconds,
            queue_length,
            breaker_state,
            breaker_trips_total,
            reaper_recoveries_total,
            active_workers,
        })
    }

    /// Renders every collector on `registry` as Prometheus text exposition (`GET /metrics`).
    pub fn encode(registry: &Registry) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .map_err(|e| QueueError::Internal(format!("metrics encode failed: {e}")))?;
        String::from_utf8(buf).map_err(|e| QueueError::Internal(format!("metrics encode produced invalid utf8: {e}")))
    }
}

fn try_register(registry: &Registry, collector: impl prometheus::core::Collector + 'static) -> Result<()> {
    match registry.register(Box::new(collector)) {
        Ok(()) => Ok(()),
        Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(QueueError::Internal(format!("metrics registration failed: {e}"))),
    }
}
