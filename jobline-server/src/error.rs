//! Thin HTTP-facing error wrapper over [`jobline_core::QueueError`] (§2 ambient stack expansion:
//! "mirrored by a thin `AppError` in the HTTP crate"), matching the teacher's `errors::AppError`
//! shape but emitting the `{ error, details?, timestamp }` envelope §6/§7 require.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use jobline_core::QueueError;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            QueueError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            QueueError::Duplicate => StatusCode::OK,
            QueueError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            QueueError::CooldownActive { .. } => StatusCode::TOO_MANY_REQUESTS,
            QueueError::AnomalyDetected(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Conflict(_) => StatusCode::CONFLICT,
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            QueueError::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::QueueClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Internal(_) | QueueError::Redis(_) | QueueError::Serialization(_) | QueueError::Io(_) | QueueError::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        let mut response = (self.status, body).into_response();
        if let Some(request_id) = self.request_id {
            if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
                response.headers_mut().insert("x-request-id", value);
            }
        }
        response
    }
}
