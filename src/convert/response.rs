//! Non-streaming inverse transforms: accumulated stream events → complete
//! OpenAI / Anthropic response objects.

use chrono::Utc;
use serde_json::Value;

use crate::models::anthropic::{AnthropicUsage, ContentBlock, MessagesResponse};
use crate::models::openai::{
    ChatCompletionResponse, Choice, CompletionTokensDetails, FunctionCall, PromptTokensDetails,
    ResponseMessage, ToolCall, Usage,
};
use crate::tokenizer;
use crate::upstream::events::{StreamEvent, UsageTotals};

/// Retain at most this much response text in memory; the stream keeps
/// flowing past the cap but later bytes are not buffered.
pub const RESPONSE_TEXT_CAP: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CollectedToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Accumulates one request's decoder events for a non-streaming response
/// (and for usage estimation on streaming ones).
#[derive(Debug, Default)]
pub struct ResponseCollector {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<CollectedToolCall>,
    pub content_length_exceeded: bool,
    /// Names learned from start events, keyed by id.
    pending_names: std::collections::HashMap<String, String>,
    truncated: bool,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(t) => self.push_text(t),
            StreamEvent::ThinkingDelta(t) => {
                if self.thinking.len() + t.len() <= RESPONSE_TEXT_CAP {
                    self.thinking.push_str(t);
                }
            }
            StreamEvent::ToolStart { id, name } => {
                self.pending_names.insert(id.clone(), name.clone());
            }
            StreamEvent::ToolDelta { .. } => {}
            StreamEvent::ToolStop { id, input } => {
                let name = self.pending_names.remove(id).unwrap_or_default();
                self.tool_calls.push(CollectedToolCall {
                    id: id.clone(),
                    name,
                    input: input.clone(),
                });
            }
            StreamEvent::ContentLengthExceeded => self.content_length_exceeded = true,
        }
    }

    fn push_text(&mut self, t: &str) {
        if self.text.len() + t.len() > RESPONSE_TEXT_CAP {
            if !self.truncated {
                tracing::warn!("response text exceeded retention cap, no longer buffering");
                self.truncated = true;
            }
            return;
        }
        self.text.push_str(t);
    }

    /// Fill in usage the upstream failed to report and estimate reasoning
    /// tokens from captured thinking text.
    pub fn finalize_usage(&self, mut usage: UsageTotals) -> UsageTotals {
        if usage.output_tokens == 0 && !(self.text.is_empty() && self.thinking.is_empty()) {
            usage.output_tokens =
                tokenizer::estimate_tokens(&self.text) + tokenizer::estimate_tokens(&self.thinking);
        }
        if !self.thinking.is_empty() {
            usage.reasoning_tokens = tokenizer::estimate_tokens(&self.thinking);
        }
        usage
    }
}

// ── OpenAI ──────────────────────────────────────────────────────

pub fn openai_response(
    model: &str,
    collector: &ResponseCollector,
    usage: &UsageTotals,
) -> ChatCompletionResponse {
    let finish_reason = if collector.content_length_exceeded {
        "length"
    } else if !collector.tool_calls.is_empty() {
        "tool_calls"
    } else {
        "stop"
    };

    let tool_calls: Vec<ToolCall> = collector
        .tool_calls
        .iter()
        .map(|tc| ToolCall {
            id: tc.id.clone(),
            kind: "function".into(),
            function: FunctionCall {
                name: tc.name.clone(),
                arguments: tc.input.to_string(),
            },
        })
        .collect();

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion",
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content: Some(collector.text.clone()),
                reasoning_content: if collector.thinking.is_empty() {
                    None
                } else {
                    Some(collector.thinking.clone())
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: Usage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
            prompt_tokens_details: (usage.cache_read_tokens > 0).then(|| PromptTokensDetails {
                cached_tokens: usage.cache_read_tokens,
            }),
            completion_tokens_details: (usage.reasoning_tokens > 0).then(|| {
                CompletionTokensDetails {
                    reasoning_tokens: usage.reasoning_tokens,
                }
            }),
        },
    }
}

// ── Anthropic ───────────────────────────────────────────────────

pub fn anthropic_response(
    model: &str,
    collector: &ResponseCollector,
    usage: &UsageTotals,
) -> MessagesResponse {
    let stop_reason = if collector.content_length_exceeded {
        "max_tokens"
    } else if !collector.tool_calls.is_empty() {
        "tool_use"
    } else {
        "end_turn"
    };

    let mut content = Vec::new();
    if !collector.thinking.is_empty() {
        content.push(ContentBlock::Thinking {
            thinking: collector.thinking.clone(),
            signature: String::new(),
        });
    }
    if !collector.text.is_empty() || collector.tool_calls.is_empty() {
        content.push(ContentBlock::Text {
            text: collector.text.clone(),
        });
    }
    for tc in &collector.tool_calls {
        content.push(ContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input: tc.input.clone(),
        });
    }

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        kind: "message",
        role: "assistant",
        model: model.to_string(),
        content,
        stop_reason: stop_reason.to_string(),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
            cache_creation_input_tokens: (usage.cache_write_tokens > 0)
                .then_some(usage.cache_write_tokens),
        },
    }
}
