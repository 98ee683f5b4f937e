//! Queue runtime binary: worker pool, reaper, outbox drainer, queue-length sampler, capacity
//! planner scheduler, and the admin HTTP surface, wired the way the teacher's `ferrex-server`
//! binary composes its background tasks and `axum` router around one `AppState`.

mod admin;
mod config;
mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use jobline_core::{
    CapacityPlanner, JobId, Metrics, MetricsRegistrar, MetricsSnapshot, OutboxProcessor, OutboxProcessorConfig,
    PlanRequest, PlannerConfig, Priority, PostgresOutboxStore, QueueLengthSampler, QueueRuntime, QueueSet, QueueStore,
    Reaper, ReaperConfig, ReadinessCheck, ReadinessGate, RedisIdempotencyStore, RedisQueueStore, RuntimeConfig,
    SamplerConfig, TokenBucket, TracingConfig, WatchedLease, init_tracing, keys,
};

use config::Config;

/// Overrides layered on top of [`Config::from_env`] (§2 ambient stack expansion: "`clap` drives
/// both the server binary's flags ... and the standalone admin CLI").
#[derive(Parser, Debug)]
#[command(name = "jobline-server", about = "Jobline queue runtime and admin HTTP surface")]
struct Args {
    #[arg(long)]
    redis_url: Option<String>,

    #[arg(long)]
    database_url: Option<String>,

    /// `host:port` to bind the admin HTTP surface to.
    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    metrics_enabled: Option<bool>,
}

struct RedisReachable {
    store: Arc<dyn QueueStore>,
}

#[async_trait]
impl ReadinessCheck for RedisReachable {
    async fn check(&self) -> Result<(), String> {
        self.store
            .list_len("jobline:readiness-probe")
            .await
            .map(|_| ())
            .map_err(|e| format!("redis unreachable: {e}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env()?;
    if let Some(v) = args.redis_url {
        cfg.redis_url = v;
    }
    if let Some(v) = args.database_url {
        cfg.database_url = Some(v);
    }
    if let Some(bind) = &args.bind {
        if let Some((host, port)) = bind.rsplit_once(':') {
            cfg.bind_host = host.to_string();
            cfg.bind_port = port.parse().unwrap_or(cfg.bind_port);
        }
    }
    if let Some(v) = args.metrics_enabled {
        cfg.metrics_enabled = v;
    }

    let tracing_config = TracingConfig {
        enabled: cfg.tracing_enabled,
        otlp_endpoint: cfg.otlp_endpoint.clone(),
        service_name: "jobline-server".to_string(),
        ..Default::default()
    };
    let _tracer_provider = init_tracing(&tracing_config)?;

    info!(redis_url = %cfg.redis_url, bind = %format!("{}:{}", cfg.bind_host, cfg.bind_port), "starting jobline-server");

    let store: Arc<dyn QueueStore> = Arc::new(RedisQueueStore::connect(&cfg.redis_url).await?);

    let idempotency_conn = open_connection_manager(&cfg.redis_url).await?;
    let idempotency = Arc::new(RedisIdempotencyStore::new(idempotency_conn));

    let queues_cfg = cfg.parsed_queues();
    if queues_cfg.is_empty() {
        anyhow::bail!("no queues configured; set JOBLINE__QUEUES");
    }

    let mut queue_set = QueueSet::new();
    let mut rate_limiters = HashMap::new();
    for q in &queues_cfg {
        queue_set.insert(q.priority, q.name.clone());
        if let (Some(rate), Some(burst)) = (q.rate_limit_per_sec, q.rate_limit_burst) {
            let queue_key = keys::queue_key(cfg.tenant.as_deref(), &q.name);
            rate_limiters.insert(q.name.clone(), TokenBucket::new(keys::rate_limit_key(&queue_key), rate, burst));
        }
    }
    let rate_limit_conn = if rate_limiters.is_empty() {
        None
    } else {
        Some(open_connection_manager(&cfg.redis_url).await?)
    };

    let runtime_config = RuntimeConfig {
        tenant: cfg.tenant.clone(),
        max_retries: cfg.max_retries,
        backoff_base: Duration::from_millis(cfg.backoff_base_ms),
        backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        idempotency_ttl: Duration::from_secs(cfg.idempotency_ttl_secs),
        idempotency_retention: Duration::from_secs(cfg.idempotency_retention_secs),
        anti_starvation_p: cfg.anti_starvation_p,
        selector_seed: cfg.selector_seed,
        max_payload_size: (cfg.max_payload_size_bytes > 0).then_some(cfg.max_payload_size_bytes),
    };
    let registrar = MetricsRegistrar::from_toggle(!cfg.metrics_enabled);
    let metrics = Arc::new(Metrics::new(registrar.registry())?);

    let runtime = Arc::new(
        QueueRuntime::new(
            store.clone(),
            idempotency,
            queue_set,
            rate_limiters,
            rate_limit_conn,
            runtime_config,
        )
        .with_metrics(metrics.clone()),
    );

    let readiness = Arc::new(ReadinessGate::new(vec![Arc::new(RedisReachable { store: store.clone() })]));

    let queue_names: Vec<String> = queues_cfg.iter().map(|q| q.name.clone()).collect();
    let admin_state = admin::AdminState {
        runtime: runtime.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
        metrics_registry: registrar.registry().clone(),
        readiness: readiness.clone(),
        tenant: cfg.tenant.clone(),
        queue_names: queue_names.clone(),
    };
    let app = admin::router(admin_state);

    let mut watched = Vec::new();
    for worker_index in 0..cfg.worker_count {
        let worker_id = worker_id_for(worker_index);
        for q in &queues_cfg {
            watched.push(WatchedLease {
                queue_key: keys::queue_key(cfg.tenant.as_deref(), &q.name),
                worker_id: worker_id.clone(),
            });
        }
    }
    let leases = Arc::new(parking_lot::RwLock::new(watched));
    let reaper = Reaper::spawn_with_metrics(
        store.clone(),
        leases,
        ReaperConfig {
            scan_interval: Duration::from_secs(cfg.reaper_scan_interval_secs),
            heartbeat_ttl: Duration::from_secs(cfg.heartbeat_ttl_secs),
        },
        Some(metrics.clone()),
    );

    let outbox_processor = match &cfg.database_url {
        Some(database_url) => {
            let outbox_store = Arc::new(PostgresOutboxStore::connect(database_url).await?);
            Some(OutboxProcessor::spawn(
                outbox_store,
                runtime.clone(),
                OutboxProcessorConfig {
                    poll_interval: Duration::from_millis(cfg.outbox_poll_interval_ms),
                    batch_size: cfg.outbox_batch_size,
                    max_attempts: cfg.outbox_max_attempts,
                    publish_priority: Priority::Medium,
                },
            ))
        }
        None => {
            info!("no database_url configured; outbox processor disabled");
            None
        }
    };

    let sampler_keys: Vec<String> = queues_cfg
        .iter()
        .flat_map(|q| {
            let queue_key = keys::queue_key(cfg.tenant.as_deref(), &q.name);
            vec![queue_key.clone(), keys::dlq_key(&queue_key)]
        })
        .collect();
    let sampler = QueueLengthSampler::spawn(
        store.clone(),
        metrics.clone(),
        SamplerConfig {
            interval: Duration::from_secs(cfg.sampler_interval_secs),
            keys: sampler_keys,
        },
    );

    let mut worker_handles = Vec::with_capacity(cfg.worker_count as usize);
    for worker_index in 0..cfg.worker_count {
        let worker_id = worker_id_for(worker_index);
        let runtime = runtime.clone();
        let store = store.clone();
        let metrics = metrics.clone();
        let poll_timeout = cfg.worker_poll_timeout();
        let heartbeat_ttl = Duration::from_secs(cfg.heartbeat_ttl_secs);
        let heartbeat_keys: Vec<String> = queues_cfg
            .iter()
            .map(|q| keys::heartbeat_key(&keys::queue_key(cfg.tenant.as_deref(), &q.name), &worker_id))
            .collect();
        worker_handles.push(tokio::spawn(async move {
            worker_loop(worker_id, runtime, store, metrics, poll_timeout, heartbeat_ttl, heartbeat_keys).await;
        }));
    }

    let planner_handle = if cfg.planner_enabled {
        Some(spawn_planner_scheduler(runtime.clone(), cfg.clone()))
    } else {
        None
    };

    readiness.mark_started();

    let bind_addr = format!("{}:{}", cfg.bind_host, cfg.bind_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "admin http listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    runtime.shutdown_token().cancel();
    for handle in worker_handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "worker task panicked during shutdown");
        }
    }
    if let Some(handle) = planner_handle {
        handle.abort();
    }
    reaper.shutdown().await;
    sampler.shutdown().await;
    if let Some(processor) = outbox_processor {
        processor.shutdown().await;
    }

    Ok(())
}

fn worker_id_for(index: u32) -> String {
    format!("worker-{index}")
}

async fn open_connection_manager(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// One worker's dequeue loop. Job execution itself is out of scope here — the envelope's payload
/// is only ever a locator (§3) — so this binary exercises the full lease lifecycle with an
/// immediate Ack, serving as the reference consumer real handlers would replace.
async fn worker_loop(
    worker_id: String,
    runtime: Arc<QueueRuntime>,
    store: Arc<dyn QueueStore>,
    metrics: Arc<Metrics>,
    poll_timeout: Duration,
    heartbeat_ttl: Duration,
    heartbeat_keys: Vec<String>,
) {
    loop {
        for key in &heartbeat_keys {
            if let Err(err) = store.set_heartbeat(key, heartbeat_ttl).await {
                warn!(worker_id = %worker_id, error = %err, "failed to set heartbeat");
            }
        }

        match runtime.dequeue(&worker_id, poll_timeout).await {
            Ok(Some(lease)) => {
                metrics.jobs_consumed.inc();
                metrics.active_workers.inc();
                let timer = metrics.job_duration_seconds.start_timer();

                let job_id: JobId = lease.envelope.id.clone();
                match runtime.ack(&lease).await {
                    Ok(()) => {
                        metrics.jobs_completed.inc();
                    }
                    Err(err) => {
                        warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "ack failed");
                    }
                }
                timer.observe_duration();
                metrics.active_workers.dec();
            }
            Ok(None) => {}
            Err(jobline_core::QueueError::Interrupted) => {
                info!(worker_id = %worker_id, "worker shutting down");
                break;
            }
            Err(err) => {
                warn!(worker_id = %worker_id, error = %err, "dequeue failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Background capacity-planner tick (§4.7): periodically samples total backlog across every
/// configured queue, derives an arrival-rate estimate from the change in backlog since the last
/// tick, and generates a plan. Actual scaling is delegated externally (§4.7 design note) — this
/// loop only logs recommendations and records cooldown bookkeeping via `apply_plan`.
fn spawn_planner_scheduler(runtime: Arc<QueueRuntime>, cfg: Config) -> tokio::task::JoinHandle<()> {
    let planner_config = PlannerConfig {
        min_workers: cfg.planner_min_workers,
        max_workers: cfg.planner_max_workers,
        cooldown: Duration::from_secs(cfg.planner_cooldown_secs),
        ..Default::default()
    };

    tokio::spawn(async move {
        let mut planner = CapacityPlanner::new(planner_config);
        let mut tick = tokio::time::interval(Duration::from_secs(cfg.planner_tick_interval_secs));
        let mut last_backlog: Option<(chrono::DateTime<chrono::Utc>, u64)> = None;

        loop {
            tick.tick().await;

            let mut backlog = 0u64;
            let mut read_ok = true;
            for queue in cfg.parsed_queues() {
                match runtime.queue_depth(&queue.name).await {
                    Ok(depth) => backlog += depth,
                    Err(err) => {
                        warn!(queue = %queue.name, error = %err, "planner: failed to read queue depth");
                        read_ok = false;
                    }
                }
            }
            if !read_ok {
                continue;
            }

            let now = chrono::Utc::now();
            let arrival_rate = match last_backlog {
                Some((prev_at, prev_backlog)) => {
                    let elapsed = (now - prev_at).num_milliseconds().max(1) as f64 / 1000.0;
                    ((backlog as f64 - prev_backlog as f64) / elapsed).max(0.0)
                }
                None => 0.0,
            };
            last_backlog = Some((now, backlog));

            let snapshot = MetricsSnapshot {
                timestamp: now,
                arrival_rate,
                service_rate: cfg.planner_service_rate_per_worker,
                service_time_mean: 1.0 / cfg.planner_service_rate_per_worker.max(0.001),
                service_time_stddev: 0.0,
                backlog,
                worker_count: cfg.worker_count,
                utilization: 0.0,
            };

            let request = PlanRequest {
                current_workers: cfg.worker_count,
                target_latency: Duration::from_millis(cfg.planner_target_latency_ms),
                service_rate: cfg.planner_service_rate_per_worker,
                service_cv_squared: 1.0,
                current_metrics: snapshot,
                force_regen: false,
            };

            match planner.generate_plan(request) {
                Ok(plan) => {
                    if plan.target_workers != plan.current_workers {
                        info!(
                            current = plan.current_workers,
                            target = plan.target_workers,
                            confidence = plan.confidence,
                            "capacity planner recommends a worker count change"
                        );
                    }
                    for warning in &plan.warnings {
                        warn!(warning = %warning, "capacity planner warning");
                    }
                    if let Err(err) = planner.apply_plan(plan.id, now) {
                        warn!(error = %err, "planner: failed to record applied plan");
                    }
                }
                Err(err) if matches!(err, jobline_core::QueueError::CooldownActive { .. }) => {}
                Err(err) => warn!(error = %err, "planner: failed to generate plan"),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
