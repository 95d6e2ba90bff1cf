//! POST /v1/responses — the Responses surface.

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
use ccrelay_protocol::canonical::NativeRequest;
use ccrelay_protocol::choice::translate_tool_choice;
use ccrelay_protocol::decorate::{decorate, strip_tool_prefix};
use ccrelay_protocol::messages::MessagesResponse;
use ccrelay_protocol::responses::{self, ResponsesRequest};
use ccrelay_upstream::sse::{parse_event, SseScanner};
use tokio_util::sync::CancellationToken;

use crate::admission::{self, AdmissionGuard};
use crate::app::AppState;
use crate::stream::responses::ResponsesRewriter;
use crate::telemetry::RequestStats;

use super::StreamFlush;

pub async fn responses(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match handle(state, body).await {
        Ok(response) => response,
        Err(err) => {
            warn!(code = err.code(), error = %err, "responses request failed");
            super::error_response(&err)
        }
    }
}

async fn handle(state: Arc<AppState>, body: Value) -> Result<Response> {
    let req: ResponsesRequest =
        serde_json::from_value(body.clone()).map_err(super::bad_request)?;

    let session_key = admission::session_key(&body);
    let content_hash = admission::content_hash(&body);
    let (guard, cancel) = state
        .admission
        .begin(&session_key, &content_hash)
        .map_err(|r| RelayError::Throttled { reason: r.reason })?;

    let model = state.resolve_model(&req.model);
    info!(model = %model, stream = req.stream, session = %session_key, "responses request");

    let tools = req.tool_specs();
    let tool_choice = req
        .tool_choice
        .as_ref()
        .and_then(|c| translate_tool_choice(c, &tools));
    let native = NativeRequest {
        model: model.clone(),
        max_tokens: req.max_tokens(),
        stream: req.stream,
        conversation: req.to_conversation()?,
        tools,
        tool_choice,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: Vec::new(),
        disable_parallel_tool_use: req.parallel_tool_calls.map(|parallel| !parallel),
    };
    let mut upstream_body = native.into_body();
    decorate(&mut upstream_body, false);

    let started = Instant::now();
    let resp = state
        .upstream
        .send(&upstream_body)
        .await
        .map_err(super::map_upstream)?;

    if req.stream {
        Ok(stream_response(state, resp, model, guard, cancel, started))
    } else {
        let text = resp.text().await.map_err(|e| RelayError::UpstreamFatal {
            status: 502,
            message: e.to_string(),
        })?;
        let parsed: MessagesResponse = serde_json::from_str(&strip_tool_prefix(&text))?;
        let out = responses::build_response(&parsed, &model);

        state
            .telemetry
            .record(RequestStats {
                endpoint: "responses",
                model,
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                stop_reason: parsed.stop_reason.clone().unwrap_or_default(),
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
            "responses",
            model.clone(),
            started,
        );
        let mut scanner = SseScanner::new();
        let mut rewriter = ResponsesRewriter::new(&model);
        let mut upstream = resp.bytes_stream();
        let mut status = "ok";

        loop {
            match super::next_step(&cancel, &mut upstream).await {
                super::StreamStep::Chunk(bytes) => {
                    for frame in scanner.push(&bytes) {
                        if let Some(event) = parse_event(&frame) {
                            for out in rewriter.handle(&event) {
                                yield Ok::<_, Infallible>(Bytes::from(out));
                            }
                        }
                    }
                    flush.update(&rewriter.stats);
                }
                super::StreamStep::Failed(message) => {
                    warn!(error = %message, "upstream stream failed mid-flight");
                    status = "error";
                    for out in rewriter.error(&message) {
                        yield Ok(Bytes::from(out));
                    }
                    break;
                }
                super::StreamStep::Cancelled => {
                    info!("responses stream cancelled");
                    status = "client disconnected";
                    break;
                }
                super::StreamStep::Closed => break,
            }
        }

        for out in rewriter.finish() {
            yield Ok(Bytes::from(out));
        }
        flush.update(&rewriter.stats);
        flush.finish(status).await;
    };

    super::sse_response(Body::from_stream(stream))
}
