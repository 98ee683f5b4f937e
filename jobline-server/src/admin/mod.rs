//! Admin HTTP surface (§6): `GET /metrics`, `GET /healthz`, `GET /readyz`, and the DLQ CRUD
//! endpoints, wired up the way the teacher's `create_app` composes routes + middleware layers.

mod handlers;
mod request_id;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use prometheus::Registry;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use jobline_core::{Metrics, QueueRuntime, QueueStore, ReadinessGate};

/// Shared state behind every admin handler.
#[derive(Clone)]
pub struct AdminState {
    pub runtime: Arc<QueueRuntime>,
    pub store: Arc<dyn QueueStore>,
    pub metrics: Arc<Metrics>,
    pub metrics_registry: Registry,
    pub readiness: Arc<ReadinessGate>,
    pub tenant: Option<String>,
    /// Names of every queue the server knows about, for `purge-all` enumeration and DLQ stats.
    pub queue_names: Vec<String>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route(
            "/api/dlq/entries",
            get(handlers::list_dlq_entries).post(handlers::insert_dlq_entry),
        )
        .route("/api/dlq/stats", get(handlers::dlq_stats))
        .route("/api/dlq/entries/requeue", post(handlers::requeue_dlq_entry))
        .route("/api/dlq/entries/purge", post(handlers::purge_dlq_queue))
        .route("/api/dlq/entries/purge-all", post(handlers::purge_all_dlq))
        .layer(axum::middleware::from_fn(request_id::stamp_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
