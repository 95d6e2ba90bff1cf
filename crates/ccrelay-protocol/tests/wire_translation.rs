// End-to-end translation checks: client wire shape → canonical turns →
// decorated upstream body. These pin the behaviours tool-calling clients
// depend on.

use serde_json::json;

use ccrelay_protocol::canonical::NativeRequest;
use ccrelay_protocol::chat::ChatCompletionRequest;
use ccrelay_protocol::choice::translate_tool_choice;
use ccrelay_protocol::decorate::{decorate, strip_tool_prefix, CLI_BANNER};
use ccrelay_protocol::responses::ResponsesRequest;

fn native_body(req: ResponsesRequest) -> serde_json::Value {
    let tools = req.tool_specs();
    let tool_choice = req
        .tool_choice
        .as_ref()
        .and_then(|c| translate_tool_choice(c, &tools));
    let native = NativeRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens(),
        stream: req.stream,
        conversation: req.to_conversation().unwrap(),
        tools,
        tool_choice,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: Vec::new(),
        disable_parallel_tool_use: req.parallel_tool_calls.map(|p| !p),
    };
    native.into_body()
}

#[test]
fn responses_tool_loop_round_trip() {
    let req: ResponsesRequest = serde_json::from_value(json!({
        "model": "gpt-5",
        "input": [
            {"role": "developer", "content": "be terse"},
            {"role": "user", "content": "check A and B"},
            {"type": "function_call", "call_id": "call_A", "name": "look", "arguments": "{\"t\":\"A\"}"},
            {"type": "function_call", "call_id": "call_B", "name": "look", "arguments": "{\"t\":\"B\"}"},
            {"role": "assistant", "content": "planning"},
            {"type": "function_call_output", "call_id": "call_A", "output": "a-out"},
            {"type": "function_call_output", "call_id": "call_B", "output": "b-out"},
        ],
    }))
    .unwrap();

    let body = native_body(req);
    let messages = body["messages"].as_array().unwrap();

    assert_eq!(body["system"], "be terse");

    // user, then one assistant message carrying both calls, then one user
    // message carrying both results, then the trailing commentary
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    let calls = messages[1]["content"].as_array().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["id"], "call_A");
    assert_eq!(calls[1]["id"], "call_B");

    assert_eq!(messages[2]["role"], "user");
    let results = messages[2]["content"].as_array().unwrap();
    assert_eq!(results[0]["tool_use_id"], "call_A");
    assert_eq!(results[1]["tool_use_id"], "call_B");

    assert_eq!(messages[3]["role"], "assistant");
    assert_eq!(messages[3]["content"][0]["text"], "planning");
}

#[test]
fn chat_request_full_pipeline_decorates() {
    let req: ChatCompletionRequest = serde_json::from_value(json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "You are helpful."},
            {"role": "user", "content": "Hello"},
        ],
        "tools": [
            {"type": "function", "function": {
                "name": "get_weather",
                "description": "Look up weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}},
            }},
        ],
    }))
    .unwrap();

    let tools = req.tool_specs();
    let native = NativeRequest {
        model: "claude-sonnet-4-5".into(),
        max_tokens: req.max_tokens(),
        stream: false,
        conversation: req.to_conversation().unwrap(),
        tools,
        tool_choice: None,
        temperature: None,
        top_p: None,
        stop_sequences: Vec::new(),
        disable_parallel_tool_use: None,
    };
    let mut body = native.into_body();
    decorate(&mut body, false);

    assert_eq!(body["system"][0]["text"], CLI_BANNER);
    assert_eq!(body["system"][1]["text"], "You are helpful.");
    assert_eq!(body["tools"][0]["name"], "mcp_get_weather");
    assert_eq!(body["tools"][0]["cache_control"]["type"], "ephemeral");
    // last message got its cache marker and was lifted to blocks
    let last = body["messages"].as_array().unwrap().last().unwrap();
    assert_eq!(last["content"][0]["cache_control"]["type"], "ephemeral");
}

#[test]
fn decorate_twice_is_byte_identical() {
    let req: ChatCompletionRequest = serde_json::from_value(json!({
        "model": "gpt-4",
        "messages": [
            {"role": "user", "content": "Hello"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "probe", "arguments": "{\"x\":1}"}},
            ]},
            {"role": "tool", "tool_call_id": "c1", "content": "done"},
        ],
        "tools": [
            {"type": "function", "function": {"name": "probe", "parameters": {}}},
        ],
    }))
    .unwrap();

    let native = NativeRequest {
        model: "claude-sonnet-4-5".into(),
        max_tokens: req.max_tokens(),
        stream: false,
        conversation: req.to_conversation().unwrap(),
        tools: req.tool_specs(),
        tool_choice: None,
        temperature: None,
        top_p: None,
        stop_sequences: Vec::new(),
        disable_parallel_tool_use: None,
    };

    let mut once = native.into_body();
    decorate(&mut once, true);
    let mut twice = once.clone();
    decorate(&mut twice, true);

    assert_eq!(
        serde_json::to_string(&once).unwrap(),
        serde_json::to_string(&twice).unwrap()
    );
}

#[test]
fn strip_reverses_decoration_on_name_fields() {
    let mut body = json!({
        "model": "m",
        "messages": [
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "c1", "name": "get_weather", "input": {}},
            ]},
        ],
        "tools": [
            {"name": "get_weather", "input_schema": {"type": "object", "properties": {}}},
        ],
    });
    decorate(&mut body, false);

    let stripped = strip_tool_prefix(&serde_json::to_string(&body).unwrap());
    let round: serde_json::Value = serde_json::from_str(&stripped).unwrap();
    assert_eq!(round["tools"][0]["name"], "get_weather");
    assert_eq!(round["messages"][0]["content"][0]["name"], "get_weather");
}

#[test]
fn every_call_turn_is_followed_by_matching_results() {
    // shuffled wire orders must still satisfy the pairing invariant
    let inputs = vec![
        json!([
            {"type": "function_call", "call_id": "x", "name": "a", "arguments": "{}"},
            {"role": "assistant", "content": "mid"},
            {"type": "function_call_output", "call_id": "x", "output": "ox"},
            {"type": "function_call", "call_id": "y", "name": "b", "arguments": "{}"},
            {"type": "function_call_output", "call_id": "y", "output": "oy"},
        ]),
        json!([
            {"role": "user", "content": "go"},
            {"type": "function_call_output", "call_id": "p", "output": "op"},
            {"type": "function_call", "call_id": "p", "name": "a", "arguments": "{}"},
            {"role": "assistant", "content": "after"},
        ]),
    ];

    for input in inputs {
        let req: ResponsesRequest =
            serde_json::from_value(json!({"model": "gpt-5", "input": input})).unwrap();
        let conv = req.to_conversation().unwrap();

        use ccrelay_protocol::canonical::Turn;
        for (i, turn) in conv.turns.iter().enumerate() {
            if let Turn::AssistantToolCalls(calls) = turn {
                let Some(Turn::ToolResults(results)) = conv.turns.get(i + 1) else {
                    panic!("call turn not followed by results: {:?}", conv.turns);
                };
                let mut call_ids: Vec<&str> =
                    calls.iter().map(|c| c.call_id.as_str()).collect();
                let mut result_ids: Vec<&str> =
                    results.iter().map(|r| r.call_id.as_str()).collect();
                call_ids.sort_unstable();
                result_ids.sort_unstable();
                assert_eq!(call_ids, result_ids);
            }
        }
    }
}
