//! POST /v1/messages — native passthrough with decoration. The body is
//! not translated, only decorated, model-mapped, and prefix-stripped on
//! the way back.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tracing::{info, warn};

use ccrelay_core::error::{RelayError, Result};
use ccrelay_protocol::decorate::{decorate, strip_tool_prefix};
use ccrelay_upstream::sse::SseScanner;
use tokio_util::sync::CancellationToken;

use crate::admission::{self, AdmissionGuard};
use crate::app::AppState;
use crate::stream::messages::MessagesPassthrough;
use crate::telemetry::RequestStats;

use super::StreamFlush;

pub async fn messages(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match handle(state, body).await {
        Ok(response) => response,
        Err(err) => {
            warn!(code = err.code(), error = %err, "messages request failed");
            super::error_response(&err)
        }
    }
}

async fn handle(state: Arc<AppState>, mut body: Value) -> Result<Response> {
    let Some(model) = body.get("model").and_then(|m| m.as_str()).map(String::from) else {
        return Err(RelayError::BadRequest {
            field: "model".into(),
            message: "model is required".into(),
        });
    };
    let stream = body
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    // key and hash come from the body as the client sent it
    let session_key = admission::session_key(&body);
    let content_hash = admission::content_hash(&body);
    let (guard, cancel) = state
        .admission
        .begin(&session_key, &content_hash)
        .map_err(|r| RelayError::Throttled { reason: r.reason })?;

    let mapped = state.resolve_model(&model);
    info!(model = %mapped, stream, session = %session_key, "messages passthrough request");
    body["model"] = Value::String(mapped.clone());
    decorate(&mut body, true);

    let started = Instant::now();
    let resp = state
        .upstream
        .send(&body)
        .await
        .map_err(super::map_upstream)?;

    if stream {
        Ok(stream_response(state, resp, mapped, guard, cancel, started))
    } else {
        let text = resp.text().await.map_err(|e| RelayError::UpstreamFatal {
            status: 502,
            message: e.to_string(),
        })?;
        let out: Value = serde_json::from_str(&strip_tool_prefix(&text))?;

        state
            .telemetry
            .record(RequestStats {
                endpoint: "messages",
                model: mapped,
                input_tokens: out
                    .pointer("/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                output_tokens: out
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                stop_reason: out
                    .get("stop_reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                status: "ok".into(),
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
        drop(guard);
        Ok(Json(out).into_response())
    }
}

fn stream_response(
    state: Arc<AppState>,
    resp: reqwest::Response,
    model: String,
    guard: AdmissionGuard,
    cancel: CancellationToken,
    started: Instant,
) -> Response {
    let stream = async_stream::stream! {
        let _guard = guard;
        let mut flush = StreamFlush::new(
            state.telemetry.clone(),
            "messages",
            model.clone(),
            started,
        );
        let mut scanner = SseScanner::new();
        let mut passthrough = MessagesPassthrough::new();
        let mut upstream = resp.bytes_stream();
        let mut status = "ok";

        loop {
            match super::next_step(&cancel, &mut upstream).await {
                super::StreamStep::Chunk(bytes) => {
                    // every frame passes through, known vocabulary or not
                    for frame in scanner.push(&bytes) {
                        yield Ok::<_, Infallible>(Bytes::from(passthrough.handle(&frame)));
                    }
                    flush.update(&passthrough.stats);
                }
                super::StreamStep::Failed(message) => {
                    warn!(error = %message, "upstream stream failed mid-flight");
                    status = "error";
                    // render the failure in the native vocabulary instead
                    // of tearing the stream down
                    let err = serde_json::json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": message},
                    });
                    yield Ok(Bytes::from(format!("event: error\ndata: {err}\n\n")));
                    break;
                }
                super::StreamStep::Cancelled => {
                    info!("messages stream cancelled");
                    status = "client disconnected";
                    break;
                }
                super::StreamStep::Closed => break,
            }
        }

        flush.update(&passthrough.stats);
        flush.finish(status).await;
    };

    super::sse_response(Body::from_stream(stream))
}
