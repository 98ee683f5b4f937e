//! Background queue-length sampler (§4.8): ticks at a configured interval and updates the
//! `queue_length` gauge vector for every configured queue plus the completed/DLQ lists.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::observability::metrics::Metrics;
use crate::queue::QueueStore;

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Keys sampled every tick: registered queue keys plus `{queue}:dlq` entries the runtime
    /// already knows how to name (§6 key schema).
    pub keys: Vec<String>,
}

/// Background task handle; dropping it does not stop the task — call [`QueueLengthSampler::shutdown`].
pub struct QueueLengthSampler {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl QueueLengthSampler {
    pub fn spawn(store: Arc<dyn QueueStore>, metrics: Arc<Metrics>, config: SamplerConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => {
                        Self::sample_once(&store, &metrics, &config.keys).await;
                    }
                }
            }
        });

        Self { handle, shutdown_tx }
    }

    /// Samples every key's `LLEN`; a failure on one key logs at debug and does not interrupt the
    /// rest of the sweep (§4.8: "Errors log at debug and do not interrupt sampling").
    async fn sample_once(store: &Arc<dyn QueueStore>, metrics: &Arc<Metrics>, keys: &[String]) {
        for key in keys {
            match store.list_len(key).await {
                Ok(len) => {
                    metrics.queue_length.with_label_values(&[key.as_str()]).set(len as i64);
                }
                Err(err) => {
                    debug!(queue = %key, error = %err, "queue-length sampler: LLEN failed");
                }
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
