//! The protocol-independent conversation: an ordered sequence of turns
//! that every inbound wire shape reduces to and the upstream request body
//! is built from.
//!
//! Invariants maintained here:
//! - every tool-result turn immediately follows the call turn that
//!   produced it, with the same call-id set;
//! - whitespace-only text blocks never reach the upstream wire;
//! - call ids are unique inside one request.

use serde_json::{json, Value};
use tracing::warn;

/// One part of a user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum UserPart {
    Text(String),
    /// An image reference — a remote URL or an inline `data:` URI.
    ImageRef(String),
}

/// A single tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// The client-supplied result for one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultEntry {
    pub call_id: String,
    pub name: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// Text merged into the upstream system field.
    System(String),
    User(Vec<UserPart>),
    AssistantText(String),
    AssistantToolCalls(Vec<ToolCall>),
    /// Keyed to the immediately preceding `AssistantToolCalls` turn.
    ToolResults(Vec<ToolResultEntry>),
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub turns: Vec<Turn>,
}

/// A tool definition on its way to the upstream wire.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl Conversation {
    /// All system fragments joined in order.
    pub fn system_text(&self) -> Option<String> {
        let fragments: Vec<&str> = self
            .turns
            .iter()
            .filter_map(|t| match t {
                Turn::System(text) if !text.trim().is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if fragments.is_empty() {
            None
        } else {
            Some(fragments.join("\n\n"))
        }
    }

    /// Repair pass run after translation:
    /// 1. merge consecutive user turns;
    /// 2. for every call turn not followed by its results, lift the
    ///    matching results out of wherever they lie and splice them
    ///    immediately after.
    pub fn normalize(&mut self) {
        self.merge_consecutive_users();
        self.splice_tool_results();
    }

    fn merge_consecutive_users(&mut self) {
        let mut merged: Vec<Turn> = Vec::with_capacity(self.turns.len());
        for turn in self.turns.drain(..) {
            match (merged.last_mut(), turn) {
                (Some(Turn::User(parts)), Turn::User(more)) => parts.extend(more),
                (_, turn) => merged.push(turn),
            }
        }
        self.turns = merged;
    }

    fn splice_tool_results(&mut self) {
        let mut i = 0;
        while i < self.turns.len() {
            let call_ids: Vec<String> = match &self.turns[i] {
                Turn::AssistantToolCalls(calls) => {
                    calls.iter().map(|c| c.call_id.clone()).collect()
                }
                _ => {
                    i += 1;
                    continue;
                }
            };

            let already_paired = matches!(
                self.turns.get(i + 1),
                Some(Turn::ToolResults(results))
                    if results.iter().any(|r| call_ids.contains(&r.call_id))
            );
            if already_paired {
                i += 2;
                continue;
            }

            // Lift matching results out of later turns.
            let mut lifted: Vec<ToolResultEntry> = Vec::new();
            for turn in self.turns.iter_mut().skip(i + 1) {
                if let Turn::ToolResults(results) = turn {
                    let (take, keep): (Vec<_>, Vec<_>) = results
                        .drain(..)
                        .partition(|r| call_ids.contains(&r.call_id));
                    lifted.extend(take);
                    *results = keep;
                }
            }
            self.turns.retain(|t| !matches!(t, Turn::ToolResults(r) if r.is_empty()));

            if lifted.is_empty() {
                warn!(calls = call_ids.len(), "tool calls without results in input");
                i += 1;
                continue;
            }
            self.turns.insert(i + 1, Turn::ToolResults(lifted));
            i += 2;
        }
    }
}

/// A fully assembled upstream request, one step short of JSON.
#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub model: String,
    pub max_tokens: u32,
    pub stream: bool,
    pub conversation: Conversation,
    pub tools: Vec<ToolSpec>,
    /// Already translated to the upstream tool-choice shape.
    pub tool_choice: Option<Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub disable_parallel_tool_use: Option<bool>,
}

impl NativeRequest {
    /// Serialise to the upstream Messages body. Adjacent turns that map
    /// to the same wire role collapse into one message, and
    /// whitespace-only text blocks are dropped (the upstream rejects
    /// empty text blocks).
    pub fn into_body(self) -> Value {
        let mut messages: Vec<Value> = Vec::new();

        for turn in &self.conversation.turns {
            match turn {
                Turn::System(_) => {}
                Turn::User(parts) => {
                    let blocks: Vec<Value> = parts.iter().filter_map(user_part_block).collect();
                    if !blocks.is_empty() {
                        push_blocks(&mut messages, "user", blocks);
                    }
                }
                Turn::AssistantText(text) => {
                    if !text.trim().is_empty() {
                        push_blocks(
                            &mut messages,
                            "assistant",
                            vec![json!({"type": "text", "text": text})],
                        );
                    }
                }
                Turn::AssistantToolCalls(calls) => {
                    let blocks: Vec<Value> = calls
                        .iter()
                        .map(|c| {
                            json!({
                                "type": "tool_use",
                                "id": c.call_id,
                                "name": c.name,
                                "input": c.arguments,
                            })
                        })
                        .collect();
                    push_blocks(&mut messages, "assistant", blocks);
                }
                Turn::ToolResults(results) => {
                    let blocks: Vec<Value> = results
                        .iter()
                        .map(|r| {
                            json!({
                                "type": "tool_result",
                                "tool_use_id": r.call_id,
                                "content": r.output,
                            })
                        })
                        .collect();
                    push_blocks(&mut messages, "user", blocks);
                }
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
            "stream": self.stream,
        });

        if let Some(system) = self.conversation.system_text() {
            body["system"] = Value::String(system);
        }
        if !self.tools.is_empty() {
            let tools: Vec<Value> = self
                .tools
                .iter()
                .map(|t| {
                    let mut tool = json!({
                        "name": t.name,
                        "input_schema": t.input_schema,
                    });
                    if let Some(desc) = &t.description {
                        tool["description"] = Value::String(desc.clone());
                    }
                    tool
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(choice) = self.tool_choice {
            body["tool_choice"] = choice;
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = self.top_p {
            body["top_p"] = json!(p);
        }
        if !self.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(self.stop_sequences);
        }
        if let Some(disable) = self.disable_parallel_tool_use {
            // Preserved literally from the inbound parallel_tool_calls
            // flag, even when tools is empty.
            if let Some(choice) = body.get_mut("tool_choice") {
                choice["disable_parallel_tool_use"] = json!(disable);
            } else {
                body["tool_choice"] =
                    json!({"type": "auto", "disable_parallel_tool_use": disable});
            }
        }

        body
    }
}

fn push_blocks(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if let Some(last) = messages.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": blocks}));
}

fn user_part_block(part: &UserPart) -> Option<Value> {
    match part {
        UserPart::Text(text) => {
            if text.trim().is_empty() {
                None
            } else {
                Some(json!({"type": "text", "text": text}))
            }
        }
        UserPart::ImageRef(url) => Some(image_block(url)),
    }
}

/// `data:` URIs become inline base64 sources; anything else is a URL
/// source.
fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let media_type = meta.split(';').next().unwrap_or("image/png");
            return json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }
            });
        }
    }
    json!({
        "type": "image",
        "source": {"type": "url", "url": url}
    })
}
