//! Local-caller authentication: when an API key is configured, every
//! `/v1/*` request must present it; when none is configured the proxy is
//! open to local callers.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::app::AppState;

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.borrow().clone() else {
        return next.run(request).await;
    };

    let headers = request.headers();
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match presented {
        Some(key) if key == expected => next.run(request).await,
        _ => {
            debug!("rejected request with missing or mismatched API key");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": {
                        "code": "invalid_api_key",
                        "message": "missing or invalid API key",
                    }
                })),
            )
                .into_response()
        }
    }
}
