//! Structured server configuration, loaded from environment variables via the `config` crate
//! (§2 ambient stack expansion), following the teacher's env-var-driven `Config` split in
//! `ferrex-server::main` — only here the typed `config::Config` builder stands in for the
//! teacher's hand-rolled `env::var` calls.

use config::{Config as ConfigSource, Environment};
use serde::Deserialize;
use std::time::Duration;

use jobline_core::Priority;

/// One registered queue: its name, priority class, and an optional rate-limit rule
/// (`tokens/sec`, burst).
#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub priority: Priority,
    pub rate_limit_per_sec: Option<f64>,
    pub rate_limit_burst: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_host: String,
    pub bind_port: u16,

    pub redis_url: String,
    pub database_url: Option<String>,
    pub tenant: Option<String>,

    /// `name:priority[:rate[:burst]]` entries, e.g. `orders:critical:50:100`.
    pub queues: String,

    pub worker_count: u32,
    pub worker_poll_timeout_secs: u64,

    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Maximum `payload.file_size` an envelope may declare, in bytes. `0` disables the check.
    pub max_payload_size_bytes: u64,

    pub idempotency_ttl_secs: u64,
    pub idempotency_retention_secs: u64,
    pub anti_starvation_p: f64,
    pub selector_seed: u64,

    pub reaper_scan_interval_secs: u64,
    pub heartbeat_ttl_secs: u64,

    pub outbox_poll_interval_ms: u64,
    pub outbox_batch_size: i64,
    pub outbox_max_attempts: u32,

    pub sampler_interval_secs: u64,

    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
    pub otlp_endpoint: Option<String>,

    pub planner_enabled: bool,
    pub planner_tick_interval_secs: u64,
    pub planner_min_workers: u32,
    pub planner_max_workers: u32,
    pub planner_cooldown_secs: u64,
    /// Per-worker service rate (jobs/sec), the `mu` fed into the M/M/c search. No per-job timing
    /// is collected by this binary, so this is an operator-supplied estimate rather than a
    /// measured value.
    pub planner_service_rate_per_worker: f64,
    pub planner_target_latency_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8080,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: None,
            tenant: None,
            queues: "default:medium".to_string(),
            worker_count: 4,
            worker_poll_timeout_secs: 5,
            max_retries: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 60_000,
            max_payload_size_bytes: 0,
            idempotency_ttl_secs: 300,
            idempotency_retention_secs: 86_400,
            anti_starvation_p: 0.9,
            selector_seed: 0,
            reaper_scan_interval_secs: 15,
            heartbeat_ttl_secs: 30,
            outbox_poll_interval_ms: 500,
            outbox_batch_size: 100,
            outbox_max_attempts: 5,
            sampler_interval_secs: 5,
            metrics_enabled: true,
            tracing_enabled: false,
            otlp_endpoint: None,
            planner_enabled: false,
            planner_tick_interval_secs: 60,
            planner_min_workers: 1,
            planner_max_workers: 100,
            planner_cooldown_secs: 60,
            planner_service_rate_per_worker: 5.0,
            planner_target_latency_ms: 2000,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment, falling back to [`Config::default`] for
    /// anything unset. `METRICS_ENABLED` is read bare (no prefix) per §6's documented environment
    /// variable; every other field lives under the `JOBLINE__` prefix.
    pub fn from_env() -> anyhow::Result<Self> {
        let metrics_enabled_override = std::env::var("METRICS_ENABLED")
            .ok()
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "off"));

        let defaults = Config::default();
        let source = ConfigSource::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(Environment::with_prefix("JOBLINE").separator("__"))
            .build()?;

        let mut config: Config = source.try_deserialize()?;
        if let Some(enabled) = metrics_enabled_override {
            config.metrics_enabled = enabled;
        }
        Ok(config)
    }

    pub fn worker_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_poll_timeout_secs.max(1))
    }

    pub fn parsed_queues(&self) -> Vec<QueueConfig> {
        self.queues
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                let mut parts = entry.split(':');
                let name = parts.next()?.to_string();
                let priority = match parts.next().unwrap_or("medium") {
                    "critical" => Priority::Critical,
                    "high" => Priority::High,
                    "low" => Priority::Low,
                    _ => Priority::Medium,
                };
                let rate_limit_per_sec = parts.next().and_then(|s| s.parse().ok());
                let rate_limit_burst = parts.next().and_then(|s| s.parse().ok());
                Some(QueueConfig {
                    name,
                    priority,
                    rate_limit_per_sec,
                    rate_limit_burst,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_queue_entries_with_optional_rate_limits() {
        let config = Config {
            queues: "orders:critical:50:100, reports:low".to_string(),
            ..Config::default()
        };
        let parsed = config.parsed_queues();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "orders");
        assert_eq!(parsed[0].priority, Priority::Critical);
        assert_eq!(parsed[0].rate_limit_per_sec, Some(50.0));
        assert_eq!(parsed[0].rate_limit_burst, Some(100.0));
        assert_eq!(parsed[1].name, "reports");
        assert_eq!(parsed[1].priority, Priority::Low);
        assert_eq!(parsed[1].rate_limit_per_sec, None);
    }

    #[test]
    fn default_config_has_one_medium_priority_queue() {
        let parsed = Config::default().parsed_queues();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].priority, Priority::Medium);
    }
}
