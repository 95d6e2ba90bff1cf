pub mod chat;
pub mod health;
pub mod messages;
pub mod models;
pub mod responses;

use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use ccrelay_core::error::RelayError;
use ccrelay_upstream::UpstreamError;

use crate::stream::StreamStats;
use crate::telemetry::{RequestStats, TelemetrySink};

pub(crate) fn error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": {
                "code": err.code(),
                "message": err.to_string(),
            }
        })),
    )
        .into_response()
}

/// Name the offending field out of the serde error so 400s are
/// actionable.
pub(crate) fn bad_request(err: serde_json::Error) -> RelayError {
    let message = err.to_string();
    let field = message
        .split('`')
        .nth(1)
        .unwrap_or("body")
        .to_string();
    RelayError::BadRequest { field, message }
}

pub(crate) fn map_upstream(err: UpstreamError) -> RelayError {
    match err {
        UpstreamError::NotAuthenticated => RelayError::NotAuthenticated,
        UpstreamError::Unauthorized { message } => RelayError::RefreshFailed(message),
        UpstreamError::Api { status, message } if status == 429 || status == 529 => {
            RelayError::UpstreamTransient { status, message }
        }
        UpstreamError::Api { status, message } => RelayError::UpstreamFatal { status, message },
        UpstreamError::Http(e) => RelayError::UpstreamFatal {
            status: 502,
            message: e.to_string(),
        },
    }
}

pub(crate) fn sse_response(body: axum::body::Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// One step of the upstream read loop, resolved outside the stream
/// generator so the yield points stay in plain code.
pub(crate) enum StreamStep {
    Chunk(axum::body::Bytes),
    Failed(String),
    Cancelled,
    Closed,
}

pub(crate) async fn next_step<S>(
    cancel: &tokio_util::sync::CancellationToken,
    upstream: &mut S,
) -> StreamStep
where
    S: futures_util::Stream<Item = reqwest::Result<axum::body::Bytes>> + Unpin,
{
    use futures_util::StreamExt;
    tokio::select! {
        _ = cancel.cancelled() => StreamStep::Cancelled,
        chunk = upstream.next() => match chunk {
            Some(Ok(bytes)) => StreamStep::Chunk(bytes),
            Some(Err(e)) => StreamStep::Failed(e.to_string()),
            None => StreamStep::Closed,
        },
    }
}

/// Flushes request telemetry exactly once — explicitly at normal stream
/// end, or from `Drop` when the client goes away and the generator is
/// dropped mid-stream.
pub(crate) struct StreamFlush {
    sink: Arc<dyn TelemetrySink>,
    stats: Option<RequestStats>,
    started: Instant,
}

impl StreamFlush {
    pub fn new(
        sink: Arc<dyn TelemetrySink>,
        endpoint: &'static str,
        model: String,
        started: Instant,
    ) -> Self {
        Self {
            sink,
            stats: Some(RequestStats {
                endpoint,
                model,
                status: "client disconnected".into(),
                ..RequestStats::default()
            }),
            started,
        }
    }

    /// Fold the rewriter's latest counters in, so a disconnect flush
    /// still carries whatever was observed before the client left.
    pub fn update(&mut self, stream: &StreamStats) {
        if let Some(stats) = self.stats.as_mut() {
            if !stream.model.is_empty() {
                stats.model = stream.model.clone();
            }
            stats.input_tokens = stream.input_tokens;
            stats.output_tokens = stream.output_tokens;
            stats.stop_reason = stream.stop_reason.clone();
        }
    }

    pub async fn finish(mut self, status: &str) {
        if let Some(mut stats) = self.stats.take() {
            stats.status = status.to_string();
            stats.duration_ms = self.started.elapsed().as_millis() as u64;
            self.sink.record(stats).await;
        }
    }
}

impl Drop for StreamFlush {
    fn drop(&mut self) {
        if let Some(mut stats) = self.stats.take() {
            stats.duration_ms = self.started.elapsed().as_millis() as u64;
            let sink = self.sink.clone();
            tokio::spawn(async move {
                sink.record(stats).await;
            });
        }
    }
}
