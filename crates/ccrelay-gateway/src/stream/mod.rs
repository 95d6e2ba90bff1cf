//! Streaming rewriters: one explicit state machine per output protocol,
//! consuming the typed upstream event model and emitting ready-framed SSE
//! text. The same state is read by the text-delta, tool-start,
//! tool-delta, and finish handlers, which is why each rewriter is a
//! struct rather than a pile of callbacks.

pub mod chat;
pub mod messages;
pub mod responses;

/// Counters sniffed from the upstream stream, flushed to telemetry when
/// the response finishes (or the client goes away).
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: String,
    pub text_chars: usize,
}

/// Arguments accumulated for one in-flight tool-use block. The upstream
/// streams incremental JSON; emission waits until the block closes so a
/// tool call is always delivered atomically.
#[derive(Debug, Default)]
pub(crate) struct PendingTool {
    pub id: String,
    pub name: String,
    pub args: String,
}

impl PendingTool {
    /// The full JSON argument string, defaulting to an empty object when
    /// the upstream streamed nothing.
    pub fn arguments(&self) -> String {
        if self.args.trim().is_empty() {
            "{}".to_string()
        } else {
            self.args.clone()
        }
    }
}
