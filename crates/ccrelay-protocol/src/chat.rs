//! Chat-Completions wire shape: inbound request translation to the
//! canonical conversation and non-streaming response building.
//!
//! Translation runs two passes. The first collects every
//! `tool_call_id → tool name` mapping from assistant messages, because
//! tool-role messages only carry the id. The second emits canonical
//! turns, merging consecutive tool-role messages into a single
//! tool-results turn — the upstream requires exactly one results block
//! immediately after the assistant turn that emitted the calls.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use ccrelay_core::error::{RelayError, Result};

use crate::canonical::{Conversation, ToolCall, ToolResultEntry, ToolSpec, Turn, UserPart};
use crate::messages::{ContentBlock, MessagesResponse};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<Value>,
    pub tools: Option<Vec<ChatTool>>,
    pub tool_choice: Option<Value>,
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    pub tool_calls: Option<Vec<ChatToolCall>>,
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatFunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as the wire carries them.
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatTool {
    pub function: ChatFunctionDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatFunctionDef {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

impl ChatCompletionRequest {
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
            .or(self.max_completion_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn stop_sequences(&self) -> Vec<String> {
        match &self.stop {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|t| ToolSpec {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect()
    }

    /// Reduce the flat message list to canonical turns.
    pub fn to_conversation(&self) -> Result<Conversation> {
        // Pass 1: tool_call_id → tool name, from assistant messages.
        let mut call_names: HashMap<String, String> = HashMap::new();
        for msg in &self.messages {
            for tc in msg.tool_calls.as_deref().unwrap_or_default() {
                call_names.insert(tc.id.clone(), tc.function.name.clone());
            }
        }

        // Pass 2: emit turns, batching consecutive tool-role messages.
        let mut conv = Conversation::default();
        let mut pending_results: Vec<ToolResultEntry> = Vec::new();

        for msg in &self.messages {
            if msg.role != "tool" && !pending_results.is_empty() {
                conv.turns
                    .push(Turn::ToolResults(std::mem::take(&mut pending_results)));
            }

            match msg.role.as_str() {
                "system" | "developer" => {
                    conv.turns.push(Turn::System(flatten_text(&msg.content)));
                }
                "user" => {
                    conv.turns.push(Turn::User(user_parts(&msg.content)?));
                }
                "assistant" => {
                    let text = flatten_text(&msg.content);
                    if !text.trim().is_empty() {
                        conv.turns.push(Turn::AssistantText(text));
                    }
                    if let Some(calls) = &msg.tool_calls {
                        if !calls.is_empty() {
                            let calls = calls
                                .iter()
                                .map(|tc| ToolCall {
                                    call_id: tc.id.clone(),
                                    name: tc.function.name.clone(),
                                    arguments: parse_arguments(&tc.function.arguments),
                                })
                                .collect();
                            conv.turns.push(Turn::AssistantToolCalls(calls));
                        }
                    }
                }
                "tool" => {
                    let call_id = msg.tool_call_id.clone().ok_or_else(|| {
                        RelayError::BadRequest {
                            field: "messages[].tool_call_id".into(),
                            message: "tool message without tool_call_id".into(),
                        }
                    })?;
                    let name = call_names.get(&call_id).cloned().unwrap_or_else(|| {
                        warn!(call_id = %call_id, "tool result without a matching call");
                        String::new()
                    });
                    pending_results.push(ToolResultEntry {
                        call_id,
                        name,
                        output: flatten_text(&msg.content),
                    });
                }
                other => {
                    return Err(RelayError::BadRequest {
                        field: "messages[].role".into(),
                        message: format!("unknown role {other:?}"),
                    });
                }
            }
        }
        if !pending_results.is_empty() {
            conv.turns.push(Turn::ToolResults(pending_results));
        }

        conv.normalize();
        Ok(conv)
    }
}

/// Map an upstream stop reason to a Chat-Completions finish reason.
pub fn finish_reason(stop_reason: Option<&str>, saw_tool_call: bool) -> &'static str {
    if saw_tool_call {
        return "tool_calls";
    }
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

/// Build the non-streaming `chat.completion` response. The caller has
/// already stripped the tool-name prefix from the upstream body.
pub fn build_response(resp: &MessagesResponse, model: &str) -> Value {
    let text = resp.text();
    let tool_calls: Vec<Value> = resp
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": input.to_string(),
                }
            })),
            _ => None,
        })
        .collect();

    let mut message = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { Value::String(text) },
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls.clone());
    }

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason(resp.stop_reason.as_deref(), !tool_calls.is_empty()),
        }],
        "usage": {
            "prompt_tokens": resp.usage.input_tokens,
            "completion_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.input_tokens + resp.usage.output_tokens,
        },
    })
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| {
        warn!("tool call arguments are not valid JSON, passing raw string");
        json!({"raw": raw})
    })
}

/// Collapse string-or-parts content into plain text.
fn flatten_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| {
                if let Some(s) = p.as_str() {
                    return Some(s.to_string());
                }
                p.get("text").and_then(|t| t.as_str()).map(String::from)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Expand string-or-parts content into user parts, keeping images.
fn user_parts(content: &Value) -> Result<Vec<UserPart>> {
    match content {
        Value::String(s) => Ok(vec![UserPart::Text(s.clone())]),
        Value::Array(parts) => {
            let mut out = Vec::with_capacity(parts.len());
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") | None => {
                        let text = part
                            .get("text")
                            .and_then(|t| t.as_str())
                            .or_else(|| part.as_str())
                            .unwrap_or_default();
                        out.push(UserPart::Text(text.to_string()));
                    }
                    Some("image_url") => {
                        let url = part
                            .pointer("/image_url/url")
                            .and_then(|u| u.as_str())
                            .ok_or_else(|| RelayError::BadRequest {
                                field: "messages[].content[].image_url.url".into(),
                                message: "image part without url".into(),
                            })?;
                        out.push(UserPart::ImageRef(url.to_string()));
                    }
                    Some(other) => {
                        warn!(part_type = other, "dropping unsupported content part");
                    }
                }
            }
            Ok(out)
        }
        Value::Null => Ok(Vec::new()),
        _ => Err(RelayError::BadRequest {
            field: "messages[].content".into(),
            message: "content must be a string or an array of parts".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Usage;

    fn parse(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn simple_user_message_translates() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}],
        }));
        let conv = req.to_conversation().unwrap();
        assert_eq!(conv.turns.len(), 1);
        match &conv.turns[0] {
            Turn::User(parts) => assert_eq!(parts[0], UserPart::Text("Hello".into())),
            other => panic!("unexpected turn {other:?}"),
        }
    }

    #[test]
    fn consecutive_tool_messages_merge_into_one_results_turn() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "a", "arguments": "{}"}},
                    {"id": "c2", "type": "function", "function": {"name": "b", "arguments": "{}"}},
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "one"},
                {"role": "tool", "tool_call_id": "c2", "content": "two"},
                {"role": "user", "content": "now what"},
            ],
        }));
        let conv = req.to_conversation().unwrap();
        let kinds: Vec<&str> = conv
            .turns
            .iter()
            .map(|t| match t {
                Turn::System(_) => "system",
                Turn::User(_) => "user",
                Turn::AssistantText(_) => "text",
                Turn::AssistantToolCalls(_) => "calls",
                Turn::ToolResults(_) => "results",
            })
            .collect();
        assert_eq!(kinds, vec!["user", "calls", "results", "user"]);
        match &conv.turns[2] {
            Turn::ToolResults(results) => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].name, "a");
                assert_eq!(results[1].name, "b");
            }
            other => panic!("unexpected turn {other:?}"),
        }
    }

    #[test]
    fn tool_message_without_call_id_is_bad_request() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{"role": "tool", "content": "orphan"}],
        }));
        let err = req.to_conversation().unwrap_err();
        assert!(matches!(err, RelayError::BadRequest { .. }));
        assert!(err.to_string().contains("tool_call_id"));
    }

    #[test]
    fn response_matches_chat_completion_shape() {
        let upstream = MessagesResponse {
            id: "msg_1".into(),
            model: "claude-sonnet-4-5".into(),
            content: vec![ContentBlock::Text { text: "Hi".into() }],
            stop_reason: Some("end_turn".into()),
            usage: Usage {
                input_tokens: 5,
                output_tokens: 1,
            },
        };
        let resp = build_response(&upstream, "claude-sonnet-4-5");
        assert_eq!(resp["object"], "chat.completion");
        assert_eq!(resp["model"], "claude-sonnet-4-5");
        assert_eq!(resp["choices"][0]["message"]["content"], "Hi");
        assert_eq!(resp["choices"][0]["finish_reason"], "stop");
        assert_eq!(resp["usage"]["prompt_tokens"], 5);
        assert_eq!(resp["usage"]["completion_tokens"], 1);
        assert_eq!(resp["usage"]["total_tokens"], 6);
    }

    #[test]
    fn tool_use_response_serialises_tool_calls() {
        let upstream = MessagesResponse {
            id: "msg_1".into(),
            model: "claude-sonnet-4-5".into(),
            content: vec![ContentBlock::ToolUse {
                id: "call_7".into(),
                name: "get_weather".into(),
                input: json!({"city": "NYC"}),
            }],
            stop_reason: Some("tool_use".into()),
            usage: Usage::default(),
        };
        let resp = build_response(&upstream, "claude-sonnet-4-5");
        assert_eq!(resp["choices"][0]["finish_reason"], "tool_calls");
        // tool-call-only output carries null content, not empty string
        assert_eq!(resp["choices"][0]["message"]["content"], Value::Null);
        let tc = &resp["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(tc["id"], "call_7");
        assert_eq!(tc["function"]["name"], "get_weather");
        assert_eq!(tc["function"]["arguments"], r#"{"city":"NYC"}"#);
    }

    #[test]
    fn stop_field_accepts_string_and_array() {
        let req = parse(json!({
            "model": "m", "messages": [], "stop": "END",
        }));
        assert_eq!(req.stop_sequences(), vec!["END".to_string()]);

        let req = parse(json!({
            "model": "m", "messages": [], "stop": ["a", "b"],
        }));
        assert_eq!(req.stop_sequences().len(), 2);
    }
}
