//! Admin endpoint bodies (§6 HTTP surface). Each handler is a thin translation layer over
//! [`jobline_core::QueueStore`]/[`jobline_core::QueueRuntime`] — no business logic lives here that
//! isn't already expressed by the core crate.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobline_core::{keys, JobEnvelope};

use crate::admin::AdminState;
use crate::error::AppError;

pub async fn healthz() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

pub async fn readyz(State(state): State<AdminState>) -> Result<Json<Value>, AppError> {
    match state.readiness.check_ready().await {
        Ok(()) => Ok(Json(serde_json::json!({ "status": "ready" }))),
        Err(reason) => Err(AppError::new(StatusCode::SERVICE_UNAVAILABLE, reason)),
    }
}

pub async fn metrics(State(state): State<AdminState>) -> Result<String, AppError> {
    jobline_core::Metrics::encode(&state.metrics_registry).map_err(AppError::from)
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub queue: String,
    pub limit: Option<i64>,
}

/// One dead-lettered job as the admin surface renders it, flattening the record the runtime
/// writes on Nack (`{ envelope, reason, dead_lettered_at }`) into a single JSON object.
#[derive(Serialize)]
pub struct DlqEntryView {
    #[serde(flatten)]
    pub envelope: JobEnvelope,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DlqRecord {
    envelope: JobEnvelope,
    reason: String,
    dead_lettered_at: DateTime<Utc>,
}

fn dlq_key_for(state: &AdminState, queue: &str) -> String {
    keys::dlq_key(&keys::queue_key(state.tenant.as_deref(), queue))
}

pub async fn list_dlq_entries(
    State(state): State<AdminState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<DlqEntryView>>, AppError> {
    let dlq_key = dlq_key_for(&state, &params.queue);
    let limit = params.limit.unwrap_or(100).max(0);
    let raw = state.store.lrange(&dlq_key, 0, limit.saturating_sub(1)).await?;

    let entries = raw
        .iter()
        .filter_map(|json| serde_json::from_str::<DlqRecord>(json).ok())
        .map(|record| DlqEntryView {
            envelope: record.envelope,
            reason: record.reason,
            dead_lettered_at: record.dead_lettered_at,
        })
        .collect();
    Ok(Json(entries))
}

#[derive(Deserialize)]
pub struct InsertDlqEntryBody {
    pub queue: String,
    pub envelope: JobEnvelope,
    pub reason: String,
}

/// Manually dead-letters a job without going through a live Nack — an operator remediation
/// escape hatch for jobs that failed out-of-band.
pub async fn insert_dlq_entry(
    State(state): State<AdminState>,
    Json(body): Json<InsertDlqEntryBody>,
) -> Result<Json<Value>, AppError> {
    let dlq_key = dlq_key_for(&state, &body.queue);
    let record = serde_json::json!({
        "envelope": body.envelope,
        "reason": body.reason,
        "dead_lettered_at": Utc::now(),
    });
    let record_json = serde_json::to_string(&record).map_err(jobline_core::QueueError::from)?;
    state.store.push_left(&dlq_key, &record_json).await?;
    Ok(Json(serde_json::json!({ "status": "dead-lettered" })))
}

#[derive(Serialize)]
pub struct DlqStatsEntry {
    pub queue: String,
    pub count: u64,
}

pub async fn dlq_stats(State(state): State<AdminState>) -> Result<Json<Vec<DlqStatsEntry>>, AppError> {
    let mut stats = Vec::with_capacity(state.queue_names.len());
    for queue in &state.queue_names {
        let dlq_key = dlq_key_for(&state, queue);
        let count = state.store.list_len(&dlq_key).await?;
        stats.push(DlqStatsEntry {
            queue: queue.clone(),
            count,
        });
    }
    Ok(Json(stats))
}

#[derive(Deserialize)]
pub struct RequeueBody {
    pub queue: String,
    pub id: String,
}

pub async fn requeue_dlq_entry(
    State(state): State<AdminState>,
    Json(body): Json<RequeueBody>,
) -> Result<Json<Value>, AppError> {
    let dlq_key = dlq_key_for(&state, &body.queue);
    let queue_key = keys::queue_key(state.tenant.as_deref(), &body.queue);

    let raw = state.store.lrange(&dlq_key, 0, -1).await?;
    let found = raw.iter().find_map(|json| {
        let record: DlqRecord = serde_json::from_str(json).ok()?;
        if record.envelope.id.as_str() == body.id {
            Some((json.clone(), record.envelope))
        } else {
            None
        }
    });

    let Some((old_json, envelope)) = found else {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("no dead-lettered entry with id {} in queue {}", body.id, body.queue),
        ));
    };

    let new_json = serde_json::to_string(&envelope).map_err(jobline_core::QueueError::from)?;
    let moved = state.store.requeue_entry(&dlq_key, &queue_key, &old_json, &new_json).await?;
    if !moved {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "entry was concurrently removed from the dead-letter queue",
        ));
    }
    Ok(Json(serde_json::json!({ "status": "requeued", "id": body.id })))
}

#[derive(Deserialize)]
pub struct PurgeBody {
    pub queue: String,
}

pub async fn purge_dlq_queue(
    State(state): State<AdminState>,
    Json(body): Json<PurgeBody>,
) -> Result<Json<Value>, AppError> {
    let dlq_key = dlq_key_for(&state, &body.queue);
    let purged = state.store.purge_list(&dlq_key).await?;
    Ok(Json(serde_json::json!({ "status": "purged", "queue": body.queue, "purged": purged })))
}

#[derive(Deserialize)]
pub struct PurgeAllQuery {
    pub confirm: Option<bool>,
}

pub async fn purge_all_dlq(
    State(state): State<AdminState>,
    Query(params): Query<PurgeAllQuery>,
) -> Result<Json<Value>, AppError> {
    if params.confirm != Some(true) {
        return Err(AppError::bad_request("purge-all requires ?confirm=true"));
    }

    let mut total = 0u64;
    for queue in &state.queue_names {
        let dlq_key = dlq_key_for(&state, queue);
        total += state.store.purge_list(&dlq_key).await?;
    }
    Ok(Json(serde_json::json!({ "status": "purged", "purged": total, "queues": state.queue_names })))
}
