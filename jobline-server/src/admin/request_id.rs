//! Stamps/propagates `X-Request-ID` on every admin request (§2 ambient stack expansion), the
//! concrete mechanism behind §6/§7's "HTTP surface always includes `X-Request-ID`".

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn stamp_request_id(mut request: Request, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);
    let request_id = request
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(header_name.clone(), value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert(header_name, value);
        response
    } else {
        next.run(request).await
    }
}
