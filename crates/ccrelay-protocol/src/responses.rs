//! Responses wire shape: a heterogeneous item list reduced to the
//! canonical conversation, and the non-streaming response envelope.
//!
//! Real clients driving tool-calling loops emit `function_call` and
//! `function_call_output` items in orders that do not satisfy the
//! call-then-results pairing the upstream insists on. The walker below
//! re-pairs them: orphan calls behind an assistant message are lifted in
//! front of it, calls are batched with outputs from the same window, and
//! a final repair pass splices any remaining stray results into place.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use ccrelay_core::error::{RelayError, Result};

use crate::canonical::{Conversation, ToolCall, ToolResultEntry, ToolSpec, Turn, UserPart};
use crate::messages::{ContentBlock, MessagesResponse};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(default)]
    pub input: Value,
    pub instructions: Option<String>,
    #[serde(default)]
    pub stream: bool,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub tools: Option<Vec<ResponsesTool>>,
    pub tool_choice: Option<Value>,
    pub parallel_tool_calls: Option<bool>,
}

/// Responses tools are flat, unlike the nested Chat-Completions shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesTool {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

impl ResponsesRequest {
    pub fn max_tokens(&self) -> u32 {
        self.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|t| t.kind.is_empty() || t.kind == "function")
            .filter_map(|t| {
                let name = t.name.clone()?;
                Some(ToolSpec {
                    name,
                    description: t.description.clone(),
                    input_schema: t
                        .parameters
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect()
    }

    pub fn to_conversation(&self) -> Result<Conversation> {
        let mut conv = Conversation::default();
        if let Some(instructions) = &self.instructions {
            conv.turns.push(Turn::System(instructions.clone()));
        }

        match &self.input {
            Value::String(text) => {
                conv.turns.push(Turn::User(vec![UserPart::Text(text.clone())]));
            }
            Value::Array(items) => walk_items(items, &mut conv)?,
            Value::Null => {}
            _ => {
                return Err(RelayError::BadRequest {
                    field: "input".into(),
                    message: "input must be a string or an array of items".into(),
                })
            }
        }

        conv.normalize();
        Ok(conv)
    }
}

// ── the item walker ──────────────────────────────────────────────────────

enum ItemKind<'a> {
    Message { role: &'a str, content: &'a Value },
    FunctionCall { call_id: &'a str, name: &'a str, arguments: &'a str },
    FunctionCallOutput { call_id: &'a str },
    Other,
}

fn classify(item: &Value) -> ItemKind<'_> {
    let kind = item.get("type").and_then(|t| t.as_str());
    match kind {
        Some("function_call") => {
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            ItemKind::FunctionCall {
                call_id,
                name: item.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
                arguments: item
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default(),
            }
        }
        Some("function_call_output") => ItemKind::FunctionCallOutput {
            call_id: item
                .get("call_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        },
        // items without a type but with a role are plain messages
        Some("message") | None if item.get("role").is_some() => ItemKind::Message {
            role: item.get("role").and_then(|r| r.as_str()).unwrap_or("user"),
            content: item.get("content").unwrap_or(&Value::Null),
        },
        _ => ItemKind::Other,
    }
}

fn is_message(item: &Value) -> bool {
    matches!(classify(item), ItemKind::Message { .. })
}

fn walk_items(items: &[Value], conv: &mut Conversation) -> Result<()> {
    // Pass 1: index every call's name and every output, by call id.
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut outputs: HashMap<String, String> = HashMap::new();
    let mut output_index: HashMap<String, usize> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        match classify(item) {
            ItemKind::FunctionCall { call_id, name, .. } => {
                call_names.insert(call_id.to_string(), name.to_string());
            }
            ItemKind::FunctionCallOutput { call_id } => {
                outputs.insert(call_id.to_string(), output_text(&items[i]));
                output_index.insert(call_id.to_string(), i);
            }
            _ => {}
        }
    }

    // Pass 2: emit turns.
    let mut consumed_calls: HashSet<usize> = HashSet::new();
    let mut consumed_outputs: HashSet<String> = HashSet::new();

    for i in 0..items.len() {
        match classify(&items[i]) {
            ItemKind::Message { role, content } => match role {
                "system" | "developer" => {
                    conv.turns.push(Turn::System(flatten_text(content)));
                }
                "assistant" => {
                    // Orphan calls behind this message: everything between
                    // the previous message item and here.
                    let mut start = i;
                    while start > 0 && !is_message(&items[start - 1]) {
                        start -= 1;
                    }
                    let orphans = collect_calls(items, start..i, &consumed_calls);
                    if !orphans.is_empty() {
                        emit_call_batch(
                            conv,
                            items,
                            &orphans,
                            &outputs,
                            &mut consumed_calls,
                            &mut consumed_outputs,
                        );
                    }

                    let text = flatten_text(content);
                    if !text.trim().is_empty() {
                        conv.turns.push(Turn::AssistantText(text));
                    }

                    // Batching window: up to the next message item. A call
                    // joins this assistant turn only when its output also
                    // lies inside the window.
                    let window_end = (i + 1..items.len())
                        .find(|&j| is_message(&items[j]))
                        .unwrap_or(items.len());
                    let windowed: Vec<usize> = collect_calls(items, i + 1..window_end, &consumed_calls)
                        .into_iter()
                        .filter(|&j| match classify(&items[j]) {
                            ItemKind::FunctionCall { call_id, .. } => output_index
                                .get(call_id)
                                .is_some_and(|&oi| oi > i && oi < window_end),
                            _ => false,
                        })
                        .collect();
                    if !windowed.is_empty() {
                        emit_call_batch(
                            conv,
                            items,
                            &windowed,
                            &outputs,
                            &mut consumed_calls,
                            &mut consumed_outputs,
                        );
                    }
                }
                _ => {
                    conv.turns.push(Turn::User(user_parts(content)?));
                }
            },
            ItemKind::FunctionCall { .. } if !consumed_calls.contains(&i) => {
                // A bare call: gather it plus immediately-following bare
                // calls, stopping at the next message or output item.
                let mut batch = vec![i];
                let mut j = i + 1;
                while j < items.len() {
                    match classify(&items[j]) {
                        ItemKind::FunctionCall { .. } if !consumed_calls.contains(&j) => {
                            batch.push(j);
                            j += 1;
                        }
                        _ => break,
                    }
                }
                emit_call_batch(
                    conv,
                    items,
                    &batch,
                    &outputs,
                    &mut consumed_calls,
                    &mut consumed_outputs,
                );
            }
            _ => {}
        }
    }

    for (call_id, _) in outputs.iter() {
        if !consumed_outputs.contains(call_id) && !call_names.contains_key(call_id) {
            warn!(call_id = %call_id, "function_call_output without a matching call, dropped");
        }
    }

    Ok(())
}

fn collect_calls(
    items: &[Value],
    range: std::ops::Range<usize>,
    consumed: &HashSet<usize>,
) -> Vec<usize> {
    range
        .filter(|j| {
            !consumed.contains(j) && matches!(classify(&items[*j]), ItemKind::FunctionCall { .. })
        })
        .collect()
}

/// Emit one `AssistantToolCalls` turn for the given call items, followed
/// by the matching `ToolResults` turn. Outputs are taken from anywhere in
/// the input; a missing output becomes an empty result so the pairing
/// invariant holds.
fn emit_call_batch(
    conv: &mut Conversation,
    items: &[Value],
    batch: &[usize],
    outputs: &HashMap<String, String>,
    consumed_calls: &mut HashSet<usize>,
    consumed_outputs: &mut HashSet<String>,
) {
    let mut calls = Vec::with_capacity(batch.len());
    let mut results = Vec::with_capacity(batch.len());
    for &j in batch {
        if let ItemKind::FunctionCall { call_id, name, arguments } = classify(&items[j]) {
            consumed_calls.insert(j);
            calls.push(ToolCall {
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: parse_arguments(arguments),
            });
            let output = outputs.get(call_id).cloned().unwrap_or_else(|| {
                warn!(call_id = %call_id, "function_call without output, pairing empty result");
                String::new()
            });
            consumed_outputs.insert(call_id.to_string());
            results.push(ToolResultEntry {
                call_id: call_id.to_string(),
                name: name.to_string(),
                output,
            });
        }
    }
    if calls.is_empty() {
        return;
    }
    conv.turns.push(Turn::AssistantToolCalls(calls));
    conv.turns.push(Turn::ToolResults(results));
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({"raw": raw}))
}

fn output_text(item: &Value) -> String {
    match item.get("output") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

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

fn user_parts(content: &Value) -> Result<Vec<UserPart>> {
    match content {
        Value::String(s) => Ok(vec![UserPart::Text(s.clone())]),
        Value::Array(parts) => {
            let mut out = Vec::with_capacity(parts.len());
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("input_image") | Some("image") => {
                        if let Some(url) = part
                            .get("image_url")
                            .and_then(|u| u.as_str())
                            .or_else(|| part.pointer("/image_url/url").and_then(|u| u.as_str()))
                        {
                            out.push(UserPart::ImageRef(url.to_string()));
                        }
                    }
                    _ => {
                        let text = part
                            .get("text")
                            .and_then(|t| t.as_str())
                            .or_else(|| part.as_str())
                            .unwrap_or_default();
                        if !text.is_empty() {
                            out.push(UserPart::Text(text.to_string()));
                        }
                    }
                }
            }
            Ok(out)
        }
        Value::Null => Ok(Vec::new()),
        _ => Err(RelayError::BadRequest {
            field: "input[].content".into(),
            message: "content must be a string or an array of parts".into(),
        }),
    }
}

// ── outbound envelope ────────────────────────────────────────────────────

/// Build the non-streaming Responses envelope. Tool names in the upstream
/// body were prefix-stripped before parsing.
pub fn build_response(resp: &MessagesResponse, model: &str) -> Value {
    let mut output: Vec<Value> = Vec::new();

    let text = resp.text();
    if !text.is_empty() {
        output.push(json!({
            "type": "message",
            "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
            "status": "completed",
            "role": "assistant",
            "content": [{
                "type": "output_text",
                "text": text,
                "annotations": [],
            }],
        }));
    }
    for (id, name, input) in resp.tool_uses() {
        output.push(json!({
            "type": "function_call",
            "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
            "call_id": id,
            "name": name,
            "arguments": input.to_string(),
            "status": "completed",
        }));
    }

    json!({
        "id": format!("resp_{}", uuid::Uuid::new_v4().simple()),
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "status": "completed",
        "model": model,
        "output": output,
        "usage": {
            "input_tokens": resp.usage.input_tokens,
            "output_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.input_tokens + resp.usage.output_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(conv: &Conversation) -> Vec<String> {
        conv.turns
            .iter()
            .map(|t| match t {
                Turn::System(_) => "system".to_string(),
                Turn::User(_) => "user".to_string(),
                Turn::AssistantText(t) => format!("text:{t}"),
                Turn::AssistantToolCalls(c) => format!(
                    "calls:{}",
                    c.iter().map(|c| c.call_id.as_str()).collect::<Vec<_>>().join(",")
                ),
                Turn::ToolResults(r) => format!(
                    "results:{}",
                    r.iter().map(|r| r.call_id.as_str()).collect::<Vec<_>>().join(",")
                ),
            })
            .collect()
    }

    fn request(input: Value) -> ResponsesRequest {
        serde_json::from_value(json!({"model": "gpt-5", "input": input})).unwrap()
    }

    #[test]
    fn string_input_is_a_user_turn() {
        let conv = request(json!("hello")).to_conversation().unwrap();
        assert_eq!(kinds(&conv), vec!["user"]);
    }

    #[test]
    fn tool_loop_wire_order_is_repaired() {
        // calls precede the assistant commentary; outputs trail it
        let conv = request(json!([
            {"role": "developer", "content": "be terse"},
            {"role": "user", "content": "check A and B"},
            {"type": "function_call", "call_id": "call_A", "name": "look", "arguments": "{}"},
            {"type": "function_call", "call_id": "call_B", "name": "look", "arguments": "{}"},
            {"role": "assistant", "content": "planning"},
            {"type": "function_call_output", "call_id": "call_A", "output": "a-out"},
            {"type": "function_call_output", "call_id": "call_B", "output": "b-out"},
        ]))
        .to_conversation()
        .unwrap();

        assert_eq!(
            kinds(&conv),
            vec![
                "system",
                "user",
                "calls:call_A,call_B",
                "results:call_A,call_B",
                "text:planning",
            ]
        );
        match &conv.turns[3] {
            Turn::ToolResults(results) => {
                assert_eq!(results[0].output, "a-out");
                assert_eq!(results[1].output, "b-out");
            }
            other => panic!("unexpected turn {other:?}"),
        }
    }

    #[test]
    fn windowed_calls_attach_to_their_assistant_message() {
        let conv = request(json!([
            {"role": "assistant", "content": "checking"},
            {"type": "function_call", "call_id": "c1", "name": "probe", "arguments": "{}"},
            {"type": "function_call_output", "call_id": "c1", "output": "found"},
            {"role": "assistant", "content": "done"},
        ]))
        .to_conversation()
        .unwrap();

        assert_eq!(
            kinds(&conv),
            vec!["text:checking", "calls:c1", "results:c1", "text:done"]
        );
    }

    #[test]
    fn call_without_windowed_output_becomes_a_later_turn() {
        let conv = request(json!([
            {"role": "assistant", "content": "first"},
            {"type": "function_call", "call_id": "c1", "name": "probe", "arguments": "{}"},
            {"role": "assistant", "content": "second"},
            {"type": "function_call_output", "call_id": "c1", "output": "late"},
        ]))
        .to_conversation()
        .unwrap();

        assert_eq!(
            kinds(&conv),
            vec!["text:first", "calls:c1", "results:c1", "text:second"]
        );
    }

    #[test]
    fn bare_call_run_stops_at_output_item() {
        let conv = request(json!([
            {"type": "function_call", "call_id": "c1", "name": "a", "arguments": "{}"},
            {"type": "function_call_output", "call_id": "c1", "output": "one"},
            {"type": "function_call", "call_id": "c2", "name": "b", "arguments": "{}"},
            {"type": "function_call_output", "call_id": "c2", "output": "two"},
        ]))
        .to_conversation()
        .unwrap();

        assert_eq!(
            kinds(&conv),
            vec!["calls:c1", "results:c1", "calls:c2", "results:c2"]
        );
    }

    #[test]
    fn call_without_any_output_pairs_an_empty_result() {
        let conv = request(json!([
            {"type": "function_call", "call_id": "c1", "name": "probe", "arguments": "{}"},
        ]))
        .to_conversation()
        .unwrap();

        assert_eq!(kinds(&conv), vec!["calls:c1", "results:c1"]);
        match &conv.turns[1] {
            Turn::ToolResults(results) => assert_eq!(results[0].output, ""),
            other => panic!("unexpected turn {other:?}"),
        }
    }

    #[test]
    fn consecutive_user_items_merge() {
        let conv = request(json!([
            {"role": "user", "content": "one"},
            {"role": "user", "content": "two"},
        ]))
        .to_conversation()
        .unwrap();
        assert_eq!(kinds(&conv), vec!["user"]);
    }

    #[test]
    fn non_list_input_is_bad_request() {
        let err = request(json!(42)).to_conversation().unwrap_err();
        assert!(matches!(err, RelayError::BadRequest { .. }));
    }

    #[test]
    fn envelope_has_output_array_and_usage() {
        use crate::messages::Usage;
        let upstream = MessagesResponse {
            id: "msg".into(),
            model: "claude-sonnet-4-5".into(),
            content: vec![ContentBlock::Text { text: "done".into() }],
            stop_reason: Some("end_turn".into()),
            usage: Usage {
                input_tokens: 7,
                output_tokens: 2,
            },
        };
        let resp = build_response(&upstream, "claude-sonnet-4-5");
        assert_eq!(resp["object"], "response");
        assert_eq!(resp["status"], "completed");
        assert_eq!(resp["output"][0]["type"], "message");
        assert_eq!(resp["output"][0]["content"][0]["type"], "output_text");
        assert_eq!(resp["output"][0]["content"][0]["annotations"], json!([]));
        assert_eq!(resp["usage"]["total_tokens"], 9);
    }
}
