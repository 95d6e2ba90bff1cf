//! Telemetry hook points. Sinks are optional — the pipeline works the
//! same whether anything is listening or not.

use async_trait::async_trait;
use tracing::info;

/// Per-request stats assembled by the handlers and stream rewriters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RequestStats {
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: String,
    /// "ok", "error", or "client disconnected".
    pub status: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, stats: RequestStats);
}

/// Default sink: structured log lines, nothing else.
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn record(&self, stats: RequestStats) {
        info!(
            endpoint = stats.endpoint,
            model = %stats.model,
            input_tokens = stats.input_tokens,
            output_tokens = stats.output_tokens,
            stop_reason = %stats.stop_reason,
            status = %stats.status,
            duration_ms = stats.duration_ms,
            "request completed"
        );
    }
}
