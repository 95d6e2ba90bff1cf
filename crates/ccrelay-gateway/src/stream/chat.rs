//! Upstream events → Chat-Completions chunks (`data: {json}\n\n`,
//! terminated by the literal `data: [DONE]`).

use serde_json::{json, Value};

use ccrelay_protocol::chat::finish_reason;
use ccrelay_protocol::decorate::strip_tool_name;
use ccrelay_upstream::sse::{BlockKind, UpstreamEvent};

use super::{PendingTool, StreamStats};

pub struct ChatRewriter {
    id: String,
    model: String,
    created: i64,
    tool_index: usize,
    current_tool: Option<PendingTool>,
    saw_tool_call: bool,
    saw_error: bool,
    finished: bool,
    pub stats: StreamStats,
}

impl ChatRewriter {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            tool_index: 0,
            current_tool: None,
            saw_tool_call: false,
            saw_error: false,
            finished: false,
            stats: StreamStats::default(),
        }
    }

    pub fn handle(&mut self, event: &UpstreamEvent) -> Vec<String> {
        match event {
            UpstreamEvent::MessageStart {
                model,
                input_tokens,
            } => {
                self.stats.model = model.clone();
                self.stats.input_tokens = *input_tokens;
                Vec::new()
            }
            UpstreamEvent::BlockStart { block, .. } => {
                if let BlockKind::ToolUse { id, name } = block {
                    self.current_tool = Some(PendingTool {
                        id: id.clone(),
                        name: strip_tool_name(name).to_string(),
                        args: String::new(),
                    });
                }
                Vec::new()
            }
            UpstreamEvent::TextDelta { text, .. } => {
                self.stats.text_chars += text.chars().count();
                vec![self.chunk(json!({"content": text}), None)]
            }
            UpstreamEvent::InputJsonDelta { partial, .. } => {
                if let Some(tool) = self.current_tool.as_mut() {
                    tool.args.push_str(partial);
                }
                Vec::new()
            }
            UpstreamEvent::BlockStop { .. } => match self.current_tool.take() {
                Some(tool) => {
                    let index = self.tool_index;
                    self.tool_index += 1;
                    self.saw_tool_call = true;
                    let delta = json!({
                        "tool_calls": [{
                            "index": index,
                            "id": tool.id,
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "arguments": tool.arguments(),
                            },
                        }],
                    });
                    vec![self.chunk(delta, None)]
                }
                None => Vec::new(),
            },
            UpstreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if let Some(reason) = stop_reason {
                    self.stats.stop_reason = reason.clone();
                }
                self.stats.output_tokens = *output_tokens;
                Vec::new()
            }
            UpstreamEvent::MessageStop => self.finish(),
            UpstreamEvent::Error { message } => self.error(message),
            UpstreamEvent::Ping => Vec::new(),
        }
    }

    /// Render an upstream (or transport) error inside the stream: an
    /// error-shaped chunk, then the normal terminator. The HTTP response
    /// is never torn down mid-flight — a torn stream looks like a network
    /// failure and re-triggers client retry loops.
    pub fn error(&mut self, message: &str) -> Vec<String> {
        self.saw_error = true;
        self.stats.stop_reason = "error".into();
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": if self.stats.model.is_empty() { &self.model } else { &self.stats.model },
            "choices": [{"index": 0, "delta": {}, "finish_reason": "error"}],
            "error": {"message": message},
        });
        let mut frames = vec![frame(&chunk)];
        frames.extend(self.finish());
        frames
    }

    /// Final chunk (error wins; `tool_calls` over `stop` when any call
    /// was emitted) followed by `data: [DONE]`. Safe to call twice.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let reason = if self.saw_error {
            "error"
        } else {
            finish_reason(
                (!self.stats.stop_reason.is_empty()).then_some(self.stats.stop_reason.as_str()),
                self.saw_tool_call,
            )
        };
        vec![
            self.chunk(json!({}), Some(reason)),
            "data: [DONE]\n\n".to_string(),
        ]
    }

    fn chunk(&self, delta: Value, finish: Option<&str>) -> String {
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": if self.stats.model.is_empty() { &self.model } else { &self.stats.model },
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
        });
        frame(&body)
    }
}

fn frame(body: &Value) -> String {
    format!("data: {body}\n\n")
}
