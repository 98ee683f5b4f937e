//! Reaper: periodically reclaims processing lists whose owning worker stopped heartbeating,
//! and promotes due delayed-retry entries back onto the live queue (§4.1).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::keys;
use crate::observability::Metrics;
use crate::queue::store::QueueStore;

/// One queue/worker pairing the reaper is responsible for watching.
#[derive(Clone, Debug)]
pub struct WatchedLease {
    pub queue_key: String,
    pub worker_id: String,
}

#[derive(Clone, Debug)]
pub struct ReaperConfig {
    pub scan_interval: Duration,
    pub heartbeat_ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            heartbeat_ttl: Duration::from_secs(30),
        }
    }
}

/// Background task handle; dropping it does not stop the task — call [`Reaper::shutdown`].
pub struct Reaper {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl Reaper {
    /// Spawns the reaper loop. `leases` is a shared, mutable roster of `(queue, worker_id)`
    /// pairs currently holding a processing list — the runtime registers/deregisters workers
    /// into this roster as they start and stop; the reaper only reads it.
    pub fn spawn(
        store: Arc<dyn QueueStore>,
        leases: Arc<parking_lot::RwLock<Vec<WatchedLease>>>,
        config: ReaperConfig,
    ) -> Self {
        Self::spawn_with_metrics(store, leases, config, None)
    }

    /// Same as [`Self::spawn`], additionally incrementing `reaper_recoveries_total` for every
    /// envelope reclaimed (§4.8 metrics catalogue).
    pub fn spawn_with_metrics(
        store: Arc<dyn QueueStore>,
        leases: Arc<parking_lot::RwLock<Vec<WatchedLease>>>,
        config: ReaperConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.scan_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("reaper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        Self::scan_once(&store, &leases, metrics.as_ref()).await;
                    }
                }
            }
        });

        Self { handle, shutdown_tx }
    }

    async fn scan_once(
        store: &Arc<dyn QueueStore>,
        leases: &Arc<parking_lot::RwLock<Vec<WatchedLease>>>,
        metrics: Option<&Arc<Metrics>>,
    ) {
        let snapshot: Vec<WatchedLease> = leases.read().clone();
        for lease in snapshot {
            let heartbeat_key = keys::heartbeat_key(&lease.queue_key, &lease.worker_id);
            match store.heartbeat_is_stale(&heartbeat_key).await {
                Ok(true) => {
                    let processing_key = keys::processing_key(&lease.queue_key, &lease.worker_id);
                    match store.reap_processing_list(&processing_key, &lease.queue_key).await {
                        Ok(recovered) if recovered > 0 => {
                            info!(
                                queue = %lease.queue_key,
                                worker_id = %lease.worker_id,
                                recovered,
                                "reclaimed stale reservations"
                            );
                            if let Some(metrics) = metrics {
                                metrics.reaper_recoveries_total.inc_by(recovered);
                            }
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "reaper failed to reclaim processing list"),
                    }
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "reaper failed to check heartbeat"),
            }

            let delayed_key = keys::delayed_key(&lease.queue_key);
            if let Err(err) = store.promote_due_delayed(&delayed_key, &lease.queue_key).await {
                warn!(error = %err, "reaper failed to promote due delayed entries");
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
