//! Upstream events → Responses event stream
//! (`event: {name}\ndata: {json}\n\n`).
//!
//! Message item events are created lazily on the first text delta, so a
//! pure tool-call response never grows an empty message item. Every
//! event carries a strictly increasing `sequence_number` starting at 0.

use serde_json::{json, Value};

use ccrelay_protocol::decorate::strip_tool_name;
use ccrelay_upstream::sse::{BlockKind, UpstreamEvent};

use super::{PendingTool, StreamStats};

struct OpenMessage {
    item_id: String,
    text: String,
}

pub struct ResponsesRewriter {
    response_id: String,
    model: String,
    created: i64,
    seq: u64,
    output_index: usize,
    created_sent: bool,
    message: Option<OpenMessage>,
    current_tool: Option<PendingTool>,
    /// Completed output items, replayed in `response.completed`.
    output: Vec<Value>,
    saw_error: bool,
    finished: bool,
    pub stats: StreamStats,
}

impl ResponsesRewriter {
    pub fn new(model: &str) -> Self {
        Self {
            response_id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            seq: 0,
            output_index: 0,
            created_sent: false,
            message: None,
            current_tool: None,
            output: Vec::new(),
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
                self.ensure_created()
            }
            UpstreamEvent::BlockStart { block, .. } => {
                let mut frames = Vec::new();
                if let BlockKind::ToolUse { id, name } = block {
                    // a tool call closes any open message item first
                    frames.extend(self.close_message());
                    self.current_tool = Some(PendingTool {
                        id: id.clone(),
                        name: strip_tool_name(name).to_string(),
                        args: String::new(),
                    });
                }
                frames
            }
            UpstreamEvent::TextDelta { text, .. } => {
                self.stats.text_chars += text.chars().count();
                let mut frames = self.ensure_created();
                frames.extend(self.ensure_message_open());
                let item_id = self
                    .message
                    .as_ref()
                    .map(|m| m.item_id.clone())
                    .unwrap_or_default();
                if let Some(message) = self.message.as_mut() {
                    message.text.push_str(text);
                }
                frames.push(self.frame(
                    "response.output_text.delta",
                    json!({
                        "item_id": item_id,
                        "output_index": self.output_index,
                        "content_index": 0,
                        "delta": text,
                    }),
                ));
                frames
            }
            UpstreamEvent::InputJsonDelta { partial, .. } => {
                if let Some(tool) = self.current_tool.as_mut() {
                    tool.args.push_str(partial);
                }
                Vec::new()
            }
            UpstreamEvent::BlockStop { .. } => match self.current_tool.take() {
                Some(tool) => self.emit_tool_item(tool),
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

    /// Render an in-stream error as `response.error`, then terminate
    /// normally so clients still observe a completed envelope.
    pub fn error(&mut self, message: &str) -> Vec<String> {
        self.saw_error = true;
        self.stats.stop_reason = "error".into();
        let mut frames = self.ensure_created();
        frames.push(self.frame(
            "response.error",
            json!({"error": {"message": message}}),
        ));
        frames.extend(self.finish());
        frames
    }

    /// Close whatever is open and emit `response.completed`. Safe to call
    /// twice.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut frames = self.ensure_created();
        frames.extend(self.close_message());
        if let Some(tool) = self.current_tool.take() {
            frames.extend(self.emit_tool_item(tool));
        }
        let status = if self.saw_error { "incomplete" } else { "completed" };
        let response = json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created,
            "status": status,
            "model": self.model_name(),
            "output": self.output.clone(),
            "usage": {
                "input_tokens": self.stats.input_tokens,
                "output_tokens": self.stats.output_tokens,
                "total_tokens": self.stats.input_tokens + self.stats.output_tokens,
            },
        });
        frames.push(self.frame("response.completed", json!({"response": response})));
        frames
    }

    fn ensure_created(&mut self) -> Vec<String> {
        if self.created_sent {
            return Vec::new();
        }
        self.created_sent = true;
        let response = json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created,
            "status": "in_progress",
            "model": self.model_name(),
            "output": [],
        });
        vec![self.frame("response.created", json!({"response": response}))]
    }

    /// The lazy message item: nothing is emitted until the first text
    /// delta arrives.
    fn ensure_message_open(&mut self) -> Vec<String> {
        if self.message.is_some() {
            return Vec::new();
        }
        let item_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        self.message = Some(OpenMessage {
            item_id: item_id.clone(),
            text: String::new(),
        });
        vec![
            self.frame(
                "response.output_item.added",
                json!({
                    "output_index": self.output_index,
                    "item": {
                        "type": "message",
                        "id": item_id,
                        "status": "in_progress",
                        "role": "assistant",
                        "content": [],
                    },
                }),
            ),
            self.frame(
                "response.content_part.added",
                json!({
                    "item_id": item_id,
                    "output_index": self.output_index,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": "", "annotations": []},
                }),
            ),
        ]
    }

    fn close_message(&mut self) -> Vec<String> {
        let Some(message) = self.message.take() else {
            return Vec::new();
        };
        let part = json!({
            "type": "output_text",
            "text": message.text,
            "annotations": [],
        });
        let item = json!({
            "type": "message",
            "id": message.item_id,
            "status": "completed",
            "role": "assistant",
            "content": [part.clone()],
        });
        let frames = vec![
            self.frame(
                "response.content_part.done",
                json!({
                    "item_id": item["id"].clone(),
                    "output_index": self.output_index,
                    "content_index": 0,
                    "part": part,
                }),
            ),
            self.frame(
                "response.output_item.done",
                json!({
                    "output_index": self.output_index,
                    "item": item.clone(),
                }),
            ),
        ];
        self.output.push(item);
        self.output_index += 1;
        frames
    }

    fn emit_tool_item(&mut self, tool: PendingTool) -> Vec<String> {
        let item_id = format!("fc_{}", uuid::Uuid::new_v4().simple());
        let arguments = tool.arguments();
        let item = json!({
            "type": "function_call",
            "id": item_id,
            "call_id": tool.id,
            "name": tool.name,
            "arguments": arguments,
            "status": "completed",
        });
        let mut open_item = item.clone();
        open_item["arguments"] = json!("");
        open_item["status"] = json!("in_progress");

        let mut frames = self.ensure_created();
        frames.push(self.frame(
            "response.output_item.added",
            json!({
                "output_index": self.output_index,
                "item": open_item,
            }),
        ));
        frames.push(self.frame(
            "response.function_call_arguments.done",
            json!({
                "item_id": item["id"].clone(),
                "output_index": self.output_index,
                "arguments": item["arguments"].clone(),
            }),
        ));
        frames.push(self.frame(
            "response.output_item.done",
            json!({
                "output_index": self.output_index,
                "item": item.clone(),
            }),
        ));
        self.output.push(item);
        self.output_index += 1;
        frames
    }

    fn model_name(&self) -> &str {
        if self.stats.model.is_empty() {
            &self.model
        } else {
            &self.stats.model
        }
    }

    fn frame(&mut self, name: &str, mut payload: Value) -> String {
        payload["type"] = Value::String(name.to_string());
        payload["sequence_number"] = json!(self.seq);
        self.seq += 1;
        format!("event: {name}\ndata: {payload}\n\n")
    }
}
