//! Thin `reqwest` wrapper around jobline-server's admin HTTP surface (§6).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use jobline_core::JobEnvelope;

/// Header the server's own `stamp_request_id` middleware reads and echoes back
/// (`jobline-server/src/admin/request_id.rs`) — the CLI mints one per call so a request can be
/// traced end to end in server logs.
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Remote { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
}

#[derive(Debug, Serialize)]
pub struct DlqStatsEntry {
    pub queue: String,
    pub count: u64,
}

/// Mirrors the server's `DlqEntryView` (`jobline-server/src/admin/handlers.rs`): the envelope's
/// fields flattened alongside the Nack reason and dead-letter timestamp.
#[derive(Debug, Deserialize, Serialize)]
pub struct DlqEntry {
    #[serde(flatten)]
    pub envelope: JobEnvelope,
    pub reason: String,
    pub dead_lettered_at: chrono::DateTime<chrono::Utc>,
}

pub struct AdminClient {
    base_url: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with a static config");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn request_id() -> String {
        Uuid::now_v7().to_string()
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorEnvelope>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(ClientError::Remote { status, message })
    }

    pub async fn dlq_stats(&self) -> Result<Vec<DlqStatsEntry>, ClientError> {
        let request_id = Self::request_id();
        tracing::debug!(request_id = %request_id, "GET /api/dlq/stats");
        let response = self
            .http
            .get(format!("{}/api/dlq/stats", self.base_url))
            .header(REQUEST_ID_HEADER, &request_id)
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    pub async fn peek_dlq(&self, queue: &str, limit: usize) -> Result<Vec<DlqEntry>, ClientError> {
        let request_id = Self::request_id();
        tracing::debug!(request_id = %request_id, queue, limit, "GET /api/dlq/entries");
        let response = self
            .http
            .get(format!("{}/api/dlq/entries", self.base_url))
            .header(REQUEST_ID_HEADER, &request_id)
            .query(&[("queue", queue), ("limit", &limit.to_string())])
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json().await?)
    }

    pub async fn purge_dlq(&self, queue: &str) -> Result<u64, ClientError> {
        #[derive(Deserialize)]
        struct PurgeResponse {
            purged: u64,
        }
        let request_id = Self::request_id();
        tracing::debug!(request_id = %request_id, queue, "POST /api/dlq/entries/purge");
        let response = self
            .http
            .post(format!("{}/api/dlq/entries/purge", self.base_url))
            .header(REQUEST_ID_HEADER, &request_id)
            .json(&serde_json::json!({ "queue": queue }))
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json::<PurgeResponse>().await?.purged)
    }

    pub async fn purge_all_dlq(&self) -> Result<u64, ClientError> {
        #[derive(Deserialize)]
        struct PurgeResponse {
            purged: u64,
        }
        let request_id = Self::request_id();
        tracing::debug!(request_id = %request_id, "POST /api/dlq/entries/purge-all");
        let response = self
            .http
            .post(format!("{}/api/dlq/entries/purge-all", self.base_url))
            .header(REQUEST_ID_HEADER, &request_id)
            .query(&[("confirm", "true")])
            .send()
            .await?;
        Ok(Self::check_status(response).await?.json::<PurgeResponse>().await?.purged)
    }
}
