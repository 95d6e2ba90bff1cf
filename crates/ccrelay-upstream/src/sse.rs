//! Incremental SSE parsing for the upstream Messages event stream.
//!
//! The scanner works on raw bytes and only assembles a line once its
//! terminating newline has arrived, so a multi-byte UTF-8 sequence split
//! across chunk boundaries is never decoded early. Frames are surfaced
//! both raw (for the byte-preserving passthrough route) and parsed into
//! the typed event model the rewriters consume.

use serde::Deserialize;
use tracing::debug;

/// One complete SSE frame: the event name (may be empty for nameless
/// frames) and the concatenated data lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Stateful frame scanner. Push each network chunk in as it arrives and
/// collect the frames completed so far.
#[derive(Default)]
pub struct SseScanner {
    buf: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        // Complete lines end at '\n'; a partial multi-byte sequence at the
        // buffer edge stays buffered because it cannot contain 0x0A.
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.event.is_empty() || !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
            } else if let Some(name) = line.strip_prefix("event:") {
                self.event = name.trim_start().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.trim_start().to_string());
            }
            // comment lines (":keepalive") and unknown fields are dropped
        }

        frames
    }
}

/// The upstream event vocabulary, reduced to what the rewriters need.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    MessageStart {
        model: String,
        input_tokens: u32,
    },
    BlockStart {
        index: usize,
        block: BlockKind,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    /// Partial tool-input JSON; accumulated until the block closes.
    InputJsonDelta {
        index: usize,
        partial: String,
    },
    BlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
        output_tokens: u32,
    },
    MessageStop,
    Error {
        message: String,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
    Other,
}

/// Parse one frame into the typed model. Unknown events and thinking
/// deltas return `None`; the passthrough route forwards them unparsed.
pub fn parse_event(frame: &SseFrame) -> Option<UpstreamEvent> {
    match frame.event.as_str() {
        "message_start" => {
            let msg: MessageStart = serde_json::from_str(&frame.data).ok()?;
            Some(UpstreamEvent::MessageStart {
                model: msg.message.model,
                input_tokens: msg.message.usage.input_tokens,
            })
        }
        "content_block_start" => {
            let start: ContentBlockStart = serde_json::from_str(&frame.data).ok()?;
            let block = match start.content_block.block_type.as_str() {
                "text" => BlockKind::Text,
                "tool_use" => BlockKind::ToolUse {
                    id: start.content_block.id.unwrap_or_default(),
                    name: start.content_block.name.unwrap_or_default(),
                },
                other => {
                    debug!(block_type = other, "pass-through content block");
                    BlockKind::Other
                }
            };
            Some(UpstreamEvent::BlockStart {
                index: start.index,
                block,
            })
        }
        "content_block_delta" => {
            let delta: ContentBlockDelta = serde_json::from_str(&frame.data).ok()?;
            match delta.delta.delta_type.as_str() {
                "text_delta" => Some(UpstreamEvent::TextDelta {
                    index: delta.index,
                    text: delta.delta.text?,
                }),
                "input_json_delta" => Some(UpstreamEvent::InputJsonDelta {
                    index: delta.index,
                    partial: delta.delta.partial_json?,
                }),
                _ => None,
            }
        }
        "content_block_stop" => {
            let stop: ContentBlockStop = serde_json::from_str(&frame.data).ok()?;
            Some(UpstreamEvent::BlockStop { index: stop.index })
        }
        "message_delta" => {
            let delta: MessageDelta = serde_json::from_str(&frame.data).ok()?;
            Some(UpstreamEvent::MessageDelta {
                stop_reason: delta.delta.stop_reason,
                output_tokens: delta.usage.output_tokens,
            })
        }
        "message_stop" => Some(UpstreamEvent::MessageStop),
        "error" => {
            let message = serde_json::from_str::<ErrorEvent>(&frame.data)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| frame.data.clone());
            Some(UpstreamEvent::Error { message })
        }
        "ping" => Some(UpstreamEvent::Ping),
        _ => None,
    }
}

// Upstream SSE data types (deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    #[serde(default)]
    usage: InputUsage,
}

#[derive(Default, Deserialize)]
struct InputUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    #[serde(default)]
    index: usize,
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    #[serde(default)]
    index: usize,
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockStop {
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    #[serde(default)]
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_assemble_across_chunk_boundaries() {
        let mut scanner = SseScanner::new();
        let frames = scanner.push(b"event: message_start\ndata: {\"message\":");
        assert!(frames.is_empty());
        let frames = scanner.push(b"{\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":5}}}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message_start");

        let parsed = parse_event(&frames[0]).unwrap();
        assert_eq!(
            parsed,
            UpstreamEvent::MessageStart {
                model: "claude-sonnet-4-5".into(),
                input_tokens: 5,
            }
        );
    }

    #[test]
    fn split_utf8_sequence_survives_chunking() {
        let mut scanner = SseScanner::new();
        // "héllo" with the é split across two chunks
        let payload = "data: {\"x\":\"héllo\"}\n\n".as_bytes();
        let split = payload.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let frames = scanner.push(&payload[..split]);
        assert!(frames.is_empty());
        let frames = scanner.push(&payload[split..]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.contains("héllo"));
    }

    #[test]
    fn text_and_tool_deltas_parse() {
        let delta = SseFrame {
            event: "content_block_delta".into(),
            data: r#"{"index":0,"delta":{"type":"text_delta","text":"Hi"}}"#.into(),
        };
        assert_eq!(
            parse_event(&delta),
            Some(UpstreamEvent::TextDelta {
                index: 0,
                text: "Hi".into()
            })
        );

        let delta = SseFrame {
            event: "content_block_delta".into(),
            data: r#"{"index":1,"delta":{"type":"input_json_delta","partial_json":"{\"ci"}}"#
                .into(),
        };
        assert_eq!(
            parse_event(&delta),
            Some(UpstreamEvent::InputJsonDelta {
                index: 1,
                partial: "{\"ci".into()
            })
        );
    }

    #[test]
    fn tool_block_start_carries_id_and_name() {
        let frame = SseFrame {
            event: "content_block_start".into(),
            data: r#"{"index":1,"content_block":{"type":"tool_use","id":"call_7","name":"mcp_get_weather"}}"#.into(),
        };
        match parse_event(&frame) {
            Some(UpstreamEvent::BlockStart {
                index: 1,
                block: BlockKind::ToolUse { id, name },
            }) => {
                assert_eq!(id, "call_7");
                assert_eq!(name, "mcp_get_weather");
            }
            other => panic!("unexpected parse {other:?}"),
        }
    }

    #[test]
    fn stream_error_event_parses() {
        let frame = SseFrame {
            event: "error".into(),
            data: r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#.into(),
        };
        assert_eq!(
            parse_event(&frame),
            Some(UpstreamEvent::Error {
                message: "Overloaded".into()
            })
        );
    }

    #[test]
    fn crlf_lines_and_comments_are_handled() {
        let mut scanner = SseScanner::new();
        let frames =
            scanner.push(b":keepalive\r\nevent: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "ping");
        assert_eq!(parse_event(&frames[0]), Some(UpstreamEvent::Ping));
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut scanner = SseScanner::new();
        let frames = scanner.push(
            b"event: message_stop\ndata: {}\n\nevent: ping\ndata: {}\n\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "message_stop");
        assert_eq!(frames[1].event, "ping");
    }
}
