//! Tool-choice translation from the client shapes to the upstream shape.

use serde_json::{json, Value};
use tracing::warn;

use crate::canonical::ToolSpec;

/// Translate a client tool choice to the upstream's. Returns `None` when
/// the choice should be dropped entirely.
///
/// `none`/`auto`/`required` pass through (`required` is the upstream's
/// `any`); a named function choice becomes a named tool choice; a
/// nameless function choice and `{type:any}` mean `required`. A choice
/// naming a tool that is not in the tool list downgrades to `auto`, and
/// any choice other than `none` without tools is dropped.
pub fn translate_tool_choice(choice: &Value, tools: &[ToolSpec]) -> Option<Value> {
    let translated = match choice {
        Value::String(s) => match s.as_str() {
            "none" => json!({"type": "none"}),
            "auto" => json!({"type": "auto"}),
            "required" => json!({"type": "any"}),
            other => {
                warn!(choice = other, "unknown tool_choice string, dropping");
                return None;
            }
        },
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(|t| t.as_str()).unwrap_or_default();
            // both the nested Chat-Completions shape and the flat
            // Responses shape carry the name
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| obj.get("name"))
                .and_then(|n| n.as_str());
            match (kind, name) {
                ("function", Some(name)) => json!({"type": "tool", "name": name}),
                ("function", None) | ("any", _) | ("required", _) => json!({"type": "any"}),
                ("auto", _) => json!({"type": "auto"}),
                ("none", _) => json!({"type": "none"}),
                (other, _) => {
                    warn!(choice_type = other, "unknown tool_choice object, dropping");
                    return None;
                }
            }
        }
        _ => return None,
    };

    let is_none = translated["type"] == "none";
    if tools.is_empty() && !is_none {
        // a forced choice without tools would be rejected upstream
        return None;
    }

    if let Some(name) = translated.get("name").and_then(|n| n.as_str()) {
        if !tools.iter().any(|t| t.name == name) {
            warn!(tool = name, "tool_choice names an unknown tool, downgrading to auto");
            return Some(json!({"type": "auto"}));
        }
    }

    Some(translated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn strings_pass_through() {
        let tools = [tool("a")];
        assert_eq!(
            translate_tool_choice(&json!("auto"), &tools).unwrap(),
            json!({"type": "auto"})
        );
        assert_eq!(
            translate_tool_choice(&json!("required"), &tools).unwrap(),
            json!({"type": "any"})
        );
        assert_eq!(
            translate_tool_choice(&json!("none"), &tools).unwrap(),
            json!({"type": "none"})
        );
    }

    #[test]
    fn named_function_becomes_named_tool() {
        let tools = [tool("get_weather")];
        let choice = json!({"type": "function", "function": {"name": "get_weather"}});
        assert_eq!(
            translate_tool_choice(&choice, &tools).unwrap(),
            json!({"type": "tool", "name": "get_weather"})
        );
        // flat Responses shape
        let choice = json!({"type": "function", "name": "get_weather"});
        assert_eq!(
            translate_tool_choice(&choice, &tools).unwrap(),
            json!({"type": "tool", "name": "get_weather"})
        );
    }

    #[test]
    fn nameless_function_and_any_mean_required() {
        let tools = [tool("a")];
        assert_eq!(
            translate_tool_choice(&json!({"type": "function"}), &tools).unwrap(),
            json!({"type": "any"})
        );
        assert_eq!(
            translate_tool_choice(&json!({"type": "any"}), &tools).unwrap(),
            json!({"type": "any"})
        );
    }

    #[test]
    fn unknown_tool_name_downgrades_to_auto() {
        let tools = [tool("a")];
        let choice = json!({"type": "function", "function": {"name": "missing"}});
        assert_eq!(
            translate_tool_choice(&choice, &tools).unwrap(),
            json!({"type": "auto"})
        );
    }

    #[test]
    fn forced_choice_without_tools_is_dropped() {
        assert!(translate_tool_choice(&json!("required"), &[]).is_none());
        assert!(translate_tool_choice(&json!("auto"), &[]).is_none());
        // none survives without tools
        assert!(translate_tool_choice(&json!("none"), &[]).is_some());
    }
}
