//! First-party-CLI request decoration.
//!
//! The upstream only grants OAuth traffic the privileges of its official
//! CLI when the request carries the CLI's fingerprint: the banner system
//! block, `mcp_`-prefixed tool names, object-typed tool schemas, and
//! ephemeral cache markers. Decoration is idempotent — applying it twice
//! produces byte-equivalent output — because the passthrough route may
//! receive bodies that were already decorated by a chained proxy.

use serde_json::{json, Map, Value};

/// The exact system-prompt prefix the upstream recognises.
pub const CLI_BANNER: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// Prefix the upstream expects on every tool name; stripped on the way
/// back out so clients see their original names.
pub const TOOL_PREFIX: &str = "mcp_";

/// Injected when the native endpoint is called without tools.
pub const PLACEHOLDER_TOOL: &str = "mcp_placeholder";

/// How many trailing messages receive a cache marker on their last
/// content block.
const CACHE_MESSAGE_COUNT: usize = 3;

fn cache_control() -> Value {
    json!({"type": "ephemeral"})
}

/// Decorate a native-format request body in place. `native_endpoint` is
/// true for the `/v1/messages` passthrough, which additionally receives
/// the placeholder tool when the caller supplied none.
pub fn decorate(body: &mut Value, native_endpoint: bool) {
    decorate_system(body);
    decorate_tools(body, native_endpoint);
    decorate_tool_choice(body);
    decorate_message_blocks(body);
    decorate_cache_markers(body);
}

/// Rule 1: the banner block, carrying a cache marker, leads the system
/// field. Existing system content is preserved after it.
fn decorate_system(body: &mut Value) {
    let existing = body.get("system").cloned();
    let mut blocks: Vec<Value> = match existing {
        Some(Value::String(text)) => {
            if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![json!({"type": "text", "text": text})]
            }
        }
        Some(Value::Array(blocks)) => blocks,
        _ => Vec::new(),
    };

    let has_banner = blocks
        .first()
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == CLI_BANNER);
    if !has_banner {
        blocks.insert(
            0,
            json!({
                "type": "text",
                "text": CLI_BANNER,
                "cache_control": cache_control(),
            }),
        );
    }
    body["system"] = Value::Array(blocks);
}

/// Rules 2 and 3: placeholder injection, name prefixing, schema
/// normalisation, and the cache marker on the last tool.
fn decorate_tools(body: &mut Value, native_endpoint: bool) {
    let empty = body
        .get("tools")
        .and_then(|t| t.as_array())
        .map_or(true, |t| t.is_empty());

    if empty {
        if native_endpoint {
            body["tools"] = json!([{
                "name": PLACEHOLDER_TOOL,
                "description": "",
                "input_schema": {"type": "object", "properties": {}},
            }]);
        } else {
            return;
        }
    }

    let Some(tools) = body.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return;
    };
    let last = tools.len().saturating_sub(1);
    for (i, tool) in tools.iter_mut().enumerate() {
        if let Some(name) = tool.get("name").and_then(|n| n.as_str()) {
            if !name.starts_with(TOOL_PREFIX) {
                tool["name"] = Value::String(format!("{TOOL_PREFIX}{name}"));
            }
        }
        normalize_schema(tool);
        // marker on the last tool only; earlier markers are cleared so
        // re-decoration is byte-stable
        if let Some(obj) = tool.as_object_mut() {
            if i == last {
                obj.insert("cache_control".into(), cache_control());
            } else {
                obj.remove("cache_control");
            }
        }
    }
}

/// Force `input_schema` to be object-typed with an explicit `properties`
/// field — the upstream rejects anything else.
fn normalize_schema(tool: &mut Value) {
    let schema = tool
        .get_mut("input_schema")
        .map(|s| {
            if !s.is_object() {
                *s = Value::Object(Map::new());
            }
            s
        })
        .and_then(|s| s.as_object_mut());
    let Some(schema) = schema else {
        tool["input_schema"] = json!({"type": "object", "properties": {}});
        return;
    };
    schema.insert("type".into(), Value::String("object".into()));
    schema
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
}

/// A named tool choice must agree with the prefixed tool names.
fn decorate_tool_choice(body: &mut Value) {
    let name = body
        .pointer("/tool_choice/name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.starts_with(TOOL_PREFIX))
        .map(String::from);
    if let Some(name) = name {
        body["tool_choice"]["name"] = Value::String(format!("{TOOL_PREFIX}{name}"));
    }
}

/// Rule 4: `tool_use` blocks in the history carry the prefix too, so the
/// upstream sees consistent names across turns.
fn decorate_message_blocks(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    for msg in messages {
        let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                if let Some(name) = block.get("name").and_then(|n| n.as_str()) {
                    if !name.starts_with(TOOL_PREFIX) {
                        block["name"] = Value::String(format!("{TOOL_PREFIX}{name}"));
                    }
                }
            }
        }
    }
}

/// Rule 5: an ephemeral cache marker on the last content block of the
/// last few messages. String content is lifted to a text block first.
fn decorate_cache_markers(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    let len = messages.len();
    let start = len.saturating_sub(CACHE_MESSAGE_COUNT);
    for msg in messages.iter_mut().skip(start) {
        let Some(content) = msg.get_mut("content") else {
            continue;
        };
        if content.is_string() {
            let text = std::mem::replace(content, Value::Null);
            *content = json!([{"type": "text", "text": text}]);
        }
        if let Some(last) = content
            .as_array_mut()
            .and_then(|blocks| blocks.last_mut())
            .and_then(|b| b.as_object_mut())
        {
            last.insert("cache_control".into(), cache_control());
        }
    }
}

/// Rule 6: strip the tool-name prefix from outbound JSON text — response
/// bodies and every streamed chunk — by textual substitution on
/// `"name":"mcp_X"` occurrences.
pub fn strip_tool_prefix(text: &str) -> String {
    text.replace(r#""name":"mcp_"#, r#""name":""#)
        .replace(r#""name": "mcp_"#, r#""name": ""#)
}

/// Strip the prefix from a single tool name (used where the rewriters
/// work on parsed events rather than raw text).
pub fn strip_tool_name(name: &str) -> &str {
    name.strip_prefix(TOOL_PREFIX).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_body() -> Value {
        json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "system": "You answer questions.",
            "messages": [
                {"role": "user", "content": "hi"},
            ],
            "tools": [
                {"name": "get_weather", "input_schema": {"type": "object"}},
                {"name": "search", "input_schema": {}},
            ],
        })
    }

    #[test]
    fn banner_leads_system_and_existing_content_survives() {
        let mut body = base_body();
        decorate(&mut body, false);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system[0]["text"], CLI_BANNER);
        assert_eq!(system[0]["cache_control"]["type"], "ephemeral");
        assert_eq!(system[1]["text"], "You answer questions.");
    }

    #[test]
    fn tool_names_are_prefixed_and_schemas_normalised() {
        let mut body = base_body();
        decorate(&mut body, false);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], "mcp_get_weather");
        assert_eq!(tools[1]["name"], "mcp_search");
        assert_eq!(tools[0]["input_schema"]["type"], "object");
        assert!(tools[0]["input_schema"]["properties"].is_object());
        assert!(tools[1]["input_schema"]["properties"].is_object());
        // marker on the last tool only
        assert!(tools[0].get("cache_control").is_none());
        assert_eq!(tools[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn placeholder_injected_only_on_native_endpoint() {
        let mut body = json!({"model": "m", "messages": []});
        decorate(&mut body, true);
        assert_eq!(body["tools"][0]["name"], PLACEHOLDER_TOOL);

        let mut body = json!({"model": "m", "messages": []});
        decorate(&mut body, false);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tool_use_blocks_in_history_are_prefixed() {
        let mut body = json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "c1", "name": "grep", "input": {}},
                ]},
            ],
        });
        decorate(&mut body, false);
        assert_eq!(body["messages"][0]["content"][0]["name"], "mcp_grep");
    }

    #[test]
    fn string_content_is_lifted_before_marking() {
        let mut body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "plain"}],
        });
        decorate(&mut body, false);
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "text");
        assert_eq!(block["text"], "plain");
        assert_eq!(block["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn only_last_three_messages_are_marked() {
        let mut body = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "m1"},
                {"role": "assistant", "content": "m2"},
                {"role": "user", "content": "m3"},
                {"role": "assistant", "content": "m4"},
                {"role": "user", "content": "m5"},
            ],
        });
        decorate(&mut body, false);
        let messages = body["messages"].as_array().unwrap();
        assert!(messages[0]["content"].is_string());
        assert!(messages[1]["content"].is_string());
        for msg in &messages[2..] {
            assert_eq!(msg["content"][0]["cache_control"]["type"], "ephemeral");
        }
    }

    #[test]
    fn decoration_is_idempotent() {
        let mut once = base_body();
        decorate(&mut once, true);
        let mut twice = once.clone();
        decorate(&mut twice, true);
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn named_tool_choice_is_prefixed() {
        let mut body = base_body();
        body["tool_choice"] = json!({"type": "tool", "name": "get_weather"});
        decorate(&mut body, false);
        assert_eq!(body["tool_choice"]["name"], "mcp_get_weather");
    }

    #[test]
    fn strip_reverses_prefix_on_name_fields() {
        let mut decorated = json!({
            "messages": [{"role": "assistant", "content": [
                {"type": "tool_use", "id": "c", "name": "get_weather", "input": {}},
            ]}],
        });
        decorate_message_blocks(&mut decorated);
        let stripped = strip_tool_prefix(&serde_json::to_string(&decorated).unwrap());
        assert!(stripped.contains(r#""name":"get_weather""#));
        assert!(!stripped.contains("mcp_"));
    }

    #[test]
    fn strip_handles_spaced_json() {
        let text = r#"{"name": "mcp_search", "other": 1}"#;
        assert_eq!(
            strip_tool_prefix(text),
            r#"{"name": "search", "other": 1}"#
        );
    }

    #[test]
    fn strip_tool_name_is_safe_on_unprefixed_names() {
        assert_eq!(strip_tool_name("mcp_grep"), "grep");
        assert_eq!(strip_tool_name("grep"), "grep");
    }
}
