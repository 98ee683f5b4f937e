//! Liveness/readiness gating behind a pluggable callback (§4.8 `GET /healthz`/`GET /readyz`).

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A readiness check an operator plugs in — typically "can I reach Redis" plus "is the metrics
/// server bound". Returning `Err` surfaces the message verbatim in the `503` body (§6).
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// Runs a set of [`ReadinessCheck`]s, short-circuiting on (and reporting) the first failure.
pub struct ReadinessGate {
    checks: Vec<Arc<dyn ReadinessCheck>>,
    started: AtomicBool,
}

impl ReadinessGate {
    pub fn new(checks: Vec<Arc<dyn ReadinessCheck>>) -> Self {
        Self {
            checks,
            started: AtomicBool::new(false),
        }
    }

    /// Flips liveness on — called once, after the process has finished initializing. `GET
    /// /healthz` returns 200 only after this has been called (§4.8).
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Runs every registered check, returning the first failure's message.
    pub async fn check_ready(&self) -> Result<(), String> {
        if !self.is_live() {
            return Err("server has not finished starting".to_string());
        }
        for check in &self.checks {
            check.check().await?;
        }
        Ok(())
    }
}

/// A readiness check that always succeeds — useful as a placeholder or in tests that don't wire
/// a real Redis-reachability check.
pub struct AlwaysReady;

#[async_trait]
impl ReadinessCheck for AlwaysReady {
    async fn check(&self) -> Result<(), String> {
        Ok(())
    }
}
