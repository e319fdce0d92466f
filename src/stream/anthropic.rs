//! Anthropic `message_*` / `content_block_*` SSE encoder.
//!
//! State machine invariants: exactly one `message_start` and one
//! `message_stop`, balanced block start/stop pairs, at most one block open
//! at a time, strictly increasing block indices.

use serde_json::json;

use crate::upstream::events::{StreamEvent, UsageTotals};

use super::named_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Started,
    Ended,
}

pub struct AnthropicSseEncoder {
    message_id: String,
    model: String,
    input_tokens_hint: u64,
    phase: Phase,
    block_open: Option<BlockType>,
    next_index: u64,
    saw_tool_use: bool,
    saw_content_length: bool,
}

impl AnthropicSseEncoder {
    pub fn new(model: &str, input_tokens_hint: u64) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            input_tokens_hint,
            phase: Phase::Initial,
            block_open: None,
            next_index: 0,
            saw_tool_use: false,
            saw_content_length: false,
        }
    }

    pub fn ping() -> String {
        named_event("ping", &json!({"type": "ping"}))
    }

    /// Emit `message_start`. Idempotent.
    pub fn start(&mut self) -> Vec<String> {
        if self.phase != Phase::Initial {
            return Vec::new();
        }
        self.phase = Phase::Started;
        vec![named_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens_hint, "output_tokens": 0},
                },
            }),
        )]
    }

    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<String> {
        if self.phase == Phase::Ended {
            return Vec::new();
        }
        let mut out = self.start();
        match event {
            StreamEvent::TextDelta(text) => {
                out.extend(self.ensure_block(BlockType::Text));
                out.push(self.delta(json!({"type": "text_delta", "text": text})));
            }
            StreamEvent::ThinkingDelta(text) => {
                out.extend(self.ensure_block(BlockType::Thinking));
                out.push(self.delta(json!({"type": "thinking_delta", "thinking": text})));
            }
            StreamEvent::ToolStart { id, name } => {
                self.saw_tool_use = true;
                out.extend(self.close_block());
                self.block_open = Some(BlockType::ToolUse);
                out.push(named_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.next_index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    }),
                ));
            }
            StreamEvent::ToolDelta { fragment, .. } => {
                if self.block_open == Some(BlockType::ToolUse) {
                    out.push(
                        self.delta(json!({"type": "input_json_delta", "partial_json": fragment})),
                    );
                }
            }
            StreamEvent::ToolStop { .. } => {
                if self.block_open == Some(BlockType::ToolUse) {
                    out.extend(self.close_block());
                }
            }
            StreamEvent::ContentLengthExceeded => {
                self.saw_content_length = true;
            }
        }
        out
    }

    /// Close out the stream: final block stop, `message_delta` with the
    /// stop reason and usage, then `message_stop`. Idempotent.
    pub fn finish(&mut self, usage: &UsageTotals) -> Vec<String> {
        if self.phase == Phase::Ended {
            return Vec::new();
        }
        let mut out = self.start();
        out.extend(self.close_block());

        let stop_reason = if self.saw_content_length {
            "max_tokens"
        } else if self.saw_tool_use {
            "tool_use"
        } else {
            "end_turn"
        };

        let mut usage_json = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        });
        if usage.cache_read_tokens > 0 {
            usage_json["cache_read_input_tokens"] = usage.cache_read_tokens.into();
        }
        if usage.cache_write_tokens > 0 {
            usage_json["cache_creation_input_tokens"] = usage.cache_write_tokens.into();
        }

        out.push(named_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": usage_json,
            }),
        ));
        out.push(named_event("message_stop", &json!({"type": "message_stop"})));
        self.phase = Phase::Ended;
        out
    }

    /// Mid-stream failure: emit an `error` event, then close the message
    /// cleanly so the client never sees a truncated frame sequence.
    pub fn error(&mut self, message: &str, usage: &UsageTotals) -> Vec<String> {
        if self.phase == Phase::Ended {
            return Vec::new();
        }
        let mut out = self.start();
        out.extend(self.close_block());
        out.push(named_event(
            "error",
            &json!({
                "type": "error",
                "error": {"type": "api_error", "message": message},
            }),
        ));
        out.extend(self.finish(usage));
        out
    }

    fn ensure_block(&mut self, wanted: BlockType) -> Vec<String> {
        if self.block_open == Some(wanted) {
            return Vec::new();
        }
        let mut out = self.close_block();
        self.block_open = Some(wanted);
        let content_block = match wanted {
            BlockType::Text => json!({"type": "text", "text": ""}),
            BlockType::Thinking => json!({"type": "thinking", "thinking": ""}),
            BlockType::ToolUse => unreachable!("tool blocks open via ToolStart"),
        };
        out.push(named_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.next_index,
                "content_block": content_block,
            }),
        ));
        out
    }

    fn close_block(&mut self) -> Vec<String> {
        if self.block_open.take().is_none() {
            return Vec::new();
        }
        let ev = named_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.next_index}),
        );
        self.next_index += 1;
        vec![ev]
    }

    fn delta(&self, delta: serde_json::Value) -> String {
        // Block index is the one currently open (next_index is bumped on
        // close, so it is still current here).
        named_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.next_index,
                "delta": delta,
            }),
        )
    }
}
