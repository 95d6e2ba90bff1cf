//! Native Messages passthrough: frames are forwarded unchanged apart
//! from the tool-name prefix strip, while usage, stop reason, and text
//! volume are sniffed for telemetry.

use ccrelay_protocol::decorate::strip_tool_prefix;
use ccrelay_upstream::sse::{parse_event, SseFrame, UpstreamEvent};

use super::StreamStats;

#[derive(Default)]
pub struct MessagesPassthrough {
    pub stats: StreamStats,
}

impl MessagesPassthrough {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, frame: &SseFrame) -> String {
        match parse_event(frame) {
            Some(UpstreamEvent::MessageStart {
                model,
                input_tokens,
            }) => {
                self.stats.model = model;
                self.stats.input_tokens = input_tokens;
            }
            Some(UpstreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            }) => {
                if let Some(reason) = stop_reason {
                    self.stats.stop_reason = reason;
                }
                self.stats.output_tokens = output_tokens;
            }
            Some(UpstreamEvent::TextDelta { text, .. }) => {
                self.stats.text_chars += text.chars().count();
            }
            Some(UpstreamEvent::Error { message }) => {
                tracing::warn!(error = %message, "upstream stream error passed through");
                self.stats.stop_reason = "error".into();
            }
            _ => {}
        }

        let data = strip_tool_prefix(&frame.data);
        if frame.event.is_empty() {
            format!("data: {data}\n\n")
        } else {
            format!("event: {}\ndata: {data}\n\n", frame.event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_pass_through_with_prefix_stripped() {
        let mut pt = MessagesPassthrough::new();
        let frame = SseFrame {
            event: "content_block_start".into(),
            data: r#"{"index":1,"content_block":{"type":"tool_use","id":"c","name":"mcp_grep"}}"#
                .into(),
        };
        let out = pt.handle(&frame);
        assert!(out.starts_with("event: content_block_start\ndata: "));
        assert!(out.contains(r#""name":"grep""#));
        assert!(!out.contains("mcp_"));
        assert!(out.ends_with("\n\n"));
    }

    #[test]
    fn usage_and_stop_reason_are_sniffed() {
        let mut pt = MessagesPassthrough::new();
        pt.handle(&SseFrame {
            event: "message_start".into(),
            data: r#"{"message":{"model":"claude-sonnet-4-5","usage":{"input_tokens":11}}}"#
                .into(),
        });
        pt.handle(&SseFrame {
            event: "content_block_delta".into(),
            data: r#"{"index":0,"delta":{"type":"text_delta","text":"hey"}}"#.into(),
        });
        pt.handle(&SseFrame {
            event: "message_delta".into(),
            data: r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}"#.into(),
        });

        assert_eq!(pt.stats.model, "claude-sonnet-4-5");
        assert_eq!(pt.stats.input_tokens, 11);
        assert_eq!(pt.stats.output_tokens, 6);
        assert_eq!(pt.stats.stop_reason, "end_turn");
        assert_eq!(pt.stats.text_chars, 3);
    }
}
