//! OpenAI chat-completion-chunk SSE encoder.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};

use crate::upstream::events::{StreamEvent, UsageTotals};

use super::data_event;

pub struct OpenAiSseEncoder {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finished: bool,
    saw_tool_use: bool,
    saw_content_length: bool,
    /// tool_use id → chunk index (0, 1, …) kept stable per call.
    tool_indices: HashMap<String, u64>,
}

impl OpenAiSseEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            sent_role: false,
            finished: false,
            saw_tool_use: false,
            saw_content_length: false,
            tool_indices: HashMap::new(),
        }
    }

    pub fn ping() -> String {
        ": ping\n\n".to_string()
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        data_event(&json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        }))
    }

    /// First chunk carries the assistant role.
    pub fn start(&mut self) -> Vec<String> {
        if self.sent_role {
            return Vec::new();
        }
        self.sent_role = true;
        vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
    }

    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let mut out = self.start();
        match event {
            StreamEvent::TextDelta(text) => {
                out.push(self.chunk(json!({"content": text}), None));
            }
            StreamEvent::ThinkingDelta(text) => {
                out.push(self.chunk(json!({"reasoning_content": text}), None));
            }
            StreamEvent::ToolStart { id, name } => {
                self.saw_tool_use = true;
                let index = self.tool_indices.len() as u64;
                self.tool_indices.insert(id.clone(), index);
                out.push(self.chunk(
                    json!({"tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]}),
                    None,
                ));
            }
            StreamEvent::ToolDelta { id, fragment } => {
                if let Some(index) = self.tool_indices.get(id) {
                    out.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": index,
                            "function": {"arguments": fragment},
                        }]}),
                        None,
                    ));
                }
            }
            StreamEvent::ToolStop { .. } => {}
            StreamEvent::ContentLengthExceeded => {
                self.saw_content_length = true;
            }
        }
        out
    }

    /// Final chunk with the finish reason and usage, then `[DONE]`.
    pub fn finish(&mut self, usage: &UsageTotals) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let mut out = self.start();
        self.finished = true;

        let finish_reason = if self.saw_content_length {
            "length"
        } else if self.saw_tool_use {
            "tool_calls"
        } else {
            "stop"
        };

        let mut usage_json = json!({
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.input_tokens + usage.output_tokens,
        });
        if usage.cache_read_tokens > 0 {
            usage_json["prompt_tokens_details"] = json!({"cached_tokens": usage.cache_read_tokens});
        }
        if usage.reasoning_tokens > 0 {
            usage_json["completion_tokens_details"] =
                json!({"reasoning_tokens": usage.reasoning_tokens});
        }

        out.push(data_event(&json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": finish_reason,
            }],
            "usage": usage_json,
        })));
        out.push("data: [DONE]\n\n".to_string());
        out
    }

    /// Mid-stream failure: surface an error payload, then terminate the
    /// stream with the usual `[DONE]` so clients stop reading cleanly.
    pub fn error(&mut self, message: &str, usage: &UsageTotals) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let mut out = vec![data_event(&json!({
            "error": {"message": message, "type": "api_error"},
        }))];
        out.extend(self.finish(usage));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(blocks: &[String]) -> Vec<Value> {
        blocks
            .iter()
            .filter_map(|b| b.strip_prefix("data: "))
            .filter(|d| !d.trim_end().ends_with("[DONE]"))
            .map(|d| serde_json::from_str(d.trim_end()).unwrap())
            .collect()
    }

    fn run(stream: &[StreamEvent], usage: UsageTotals) -> Vec<String> {
        let mut enc = OpenAiSseEncoder::new("claude-sonnet-4-5");
        let mut blocks = enc.start();
        for ev in stream {
            blocks.extend(enc.on_event(ev));
        }
        blocks.extend(enc.finish(&usage));
        blocks
    }

    #[test]
    fn first_chunk_has_role_and_stream_ends_with_done() {
        let blocks = run(&[StreamEvent::TextDelta("hi".into())], UsageTotals::default());
        let chunks = payloads(&blocks);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "hi");
        assert_eq!(blocks.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn tool_calls_keep_stable_indices() {
        let blocks = run(
            &[
                StreamEvent::ToolStart {
                    id: "u1".into(),
                    name: "first".into(),
                },
                StreamEvent::ToolDelta {
                    id: "u1".into(),
                    fragment: "{\"a\"".into(),
                },
                StreamEvent::ToolStart {
                    id: "u2".into(),
                    name: "second".into(),
                },
                StreamEvent::ToolDelta {
                    id: "u1".into(),
                    fragment: ":1}".into(),
                },
            ],
            UsageTotals::default(),
        );
        let chunks = payloads(&blocks);
        let tool_chunks: Vec<&Value> = chunks
            .iter()
            .filter(|c| c["choices"][0]["delta"].get("tool_calls").is_some())
            .collect();
        assert_eq!(tool_chunks[0]["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
        assert_eq!(tool_chunks[2]["choices"][0]["delta"]["tool_calls"][0]["index"], 1);
        // Fragment for u1 after u2 started still uses index 0.
        assert_eq!(tool_chunks[3]["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
    }

    #[test]
    fn finish_reason_reflects_tool_use_and_usage() {
        let usage = UsageTotals {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 4,
            ..Default::default()
        };
        let blocks = run(
            &[StreamEvent::ToolStart {
                id: "u1".into(),
                name: "t".into(),
            }],
            usage,
        );
        let chunks = payloads(&blocks);
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(last["usage"]["total_tokens"], 15);
        assert_eq!(last["usage"]["prompt_tokens_details"]["cached_tokens"], 4);
    }

    #[test]
    fn reasoning_content_is_forwarded() {
        let blocks = run(
            &[StreamEvent::ThinkingDelta("mull".into())],
            UsageTotals::default(),
        );
        let chunks = payloads(&blocks);
        assert_eq!(chunks[1]["choices"][0]["delta"]["reasoning_content"], "mull");
    }

    #[test]
    fn content_length_yields_length_finish() {
        let blocks = run(&[StreamEvent::ContentLengthExceeded], UsageTotals::default());
        let chunks = payloads(&blocks);
        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "length");
    }
}
