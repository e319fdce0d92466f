//! Frame payload dispatch and per-request stream accumulation.
//!
//! Sits between the binary decoder and the SSE encoders: routes each typed
//! frame to stream events, runs text through the thinking parser, buffers
//! streaming tool-use input, and keeps running usage totals.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;

use crate::stream::thinking::{Segment, ThinkingParser};

/// Synthetic tool-use id for the upstream's content-length exception, so
/// the SSE layer can translate it into a `max_tokens` / `length` stop.
pub const CONTENT_LENGTH_TOOL_ID: &str = "__content_length_exceeded__";

const TOOL_BUFFER_CAP: usize = 1024 * 1024;
const TOOL_BUFFER_STALE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolStart { id: String, name: String },
    /// Raw (possibly partial) JSON input fragment.
    ToolDelta { id: String, fragment: String },
    /// Finalized, parse-repaired input.
    ToolStop { id: String, input: Value },
    ContentLengthExceeded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Estimated locally from emitted thinking text.
    pub reasoning_tokens: u64,
    pub credits: f64,
    pub context_window_exceeded: bool,
}

#[derive(Debug)]
struct ToolBuffer {
    name: String,
    input: String,
    last_touched: Instant,
    started: bool,
}

#[derive(Debug)]
pub struct EventAccumulator {
    thinking_enabled: bool,
    thinking: ThinkingParser,
    tools: HashMap<String, ToolBuffer>,
    /// Order in which tool ids first appeared; used for stale pruning and
    /// deterministic flush order.
    tool_order: Vec<String>,
    /// Ids already finalized; the upstream occasionally repeats stop
    /// events and those must never be emitted twice.
    finished_tools: std::collections::HashSet<String>,
    usage: UsageTotals,
}

impl EventAccumulator {
    pub fn new(thinking_enabled: bool) -> Self {
        Self {
            thinking_enabled,
            thinking: ThinkingParser::new(),
            tools: HashMap::new(),
            tool_order: Vec::new(),
            finished_tools: std::collections::HashSet::new(),
            usage: UsageTotals::default(),
        }
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    /// Dispatch one decoded frame.
    pub fn handle(&mut self, event_type: &str, payload: &Value) -> Vec<StreamEvent> {
        match event_type {
            "assistantResponseEvent" => self.on_assistant_response(payload),
            "toolUseEvent" => self.on_tool_use(payload),
            "messageMetadataEvent" | "metadataEvent" => {
                self.on_metadata(payload);
                Vec::new()
            }
            "meteringEvent" => {
                self.on_metering(payload);
                Vec::new()
            }
            "contextUsageEvent" => {
                let pct = payload
                    .get("contextUsagePercentage")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                if pct >= 100.0 {
                    self.usage.context_window_exceeded = true;
                }
                Vec::new()
            }
            "reasoningContentEvent" => {
                if !self.thinking_enabled {
                    return Vec::new();
                }
                let content = payload
                    .get("content")
                    .or_else(|| payload.get("reasoningContent"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::ThinkingDelta(content.to_string())]
                }
            }
            "supplementaryWebLinksEvent" => self.on_web_links(payload),
            t if t.contains("Exception") || t == "exceptionEvent" => self.on_exception(t, payload),
            other => {
                tracing::debug!(event_type = other, "ignoring unknown upstream event");
                Vec::new()
            }
        }
    }

    /// End of stream: flush thinking residue and any unterminated tool
    /// buffers.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for seg in self.thinking.flush() {
            events.push(segment_event(seg));
        }
        for id in std::mem::take(&mut self.tool_order) {
            if self.finished_tools.contains(&id) {
                continue;
            }
            if let Some(buffer) = self.tools.remove(&id) {
                tracing::debug!(tool_use_id = %id, "flushing unterminated tool buffer");
                let input = parse_or_repair(&buffer.input);
                self.finished_tools.insert(id.clone());
                events.push(StreamEvent::ToolStop { id, input });
            }
        }
        events
    }

    fn on_assistant_response(&mut self, payload: &Value) -> Vec<StreamEvent> {
        // followupPrompt frames repeat content already streamed.
        if payload.get("followupPrompt").is_some() {
            return Vec::new();
        }
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if content.is_empty() {
            return Vec::new();
        }
        if self.thinking_enabled {
            self.thinking
                .push(content)
                .into_iter()
                .map(segment_event)
                .collect()
        } else {
            vec![StreamEvent::TextDelta(content.to_string())]
        }
    }

    fn on_tool_use(&mut self, payload: &Value) -> Vec<StreamEvent> {
        let Some(id) = payload
            .get("toolUseId")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Vec::new();
        };
        if self.finished_tools.contains(&id) {
            return Vec::new();
        }
        self.prune_stale_buffers();

        let mut events = Vec::new();
        let name = payload.get("name").and_then(Value::as_str).unwrap_or("");

        if !self.tools.contains_key(&id) {
            self.tool_order.push(id.clone());
            self.tools.insert(
                id.clone(),
                ToolBuffer {
                    name: String::new(),
                    input: String::new(),
                    last_touched: Instant::now(),
                    started: false,
                },
            );
        }
        let buffer = self.tools.get_mut(&id).unwrap();
        buffer.last_touched = Instant::now();
        if !name.is_empty() && buffer.name.is_empty() {
            buffer.name = name.to_string();
        }

        if !buffer.started && !buffer.name.is_empty() {
            buffer.started = true;
            events.push(StreamEvent::ToolStart {
                id: id.clone(),
                name: buffer.name.clone(),
            });
        }

        match payload.get("input") {
            Some(Value::String(fragment)) if !fragment.is_empty() => {
                if buffer.input.len() + fragment.len() <= TOOL_BUFFER_CAP {
                    buffer.input.push_str(fragment);
                } else {
                    tracing::warn!(tool_use_id = %id, "tool input buffer cap hit, dropping fragment");
                }
                events.push(StreamEvent::ToolDelta {
                    id: id.clone(),
                    fragment: fragment.clone(),
                });
            }
            Some(Value::Object(map)) => {
                // Object input replaces anything streamed so far.
                let serialized = Value::Object(map.clone()).to_string();
                buffer.input = serialized.clone();
                events.push(StreamEvent::ToolDelta {
                    id: id.clone(),
                    fragment: serialized,
                });
            }
            _ => {}
        }

        let stopped = payload.get("stop").and_then(Value::as_bool).unwrap_or(false);
        if stopped {
            let buffer = self.tools.remove(&id).unwrap();
            self.tool_order.retain(|x| x != &id);
            let input = parse_or_repair(&buffer.input);
            self.finished_tools.insert(id.clone());
            events.push(StreamEvent::ToolStop { id, input });
        }

        events
    }

    fn on_metadata(&mut self, payload: &Value) {
        // Usage may be nested one level down.
        let node = payload.get("usage").unwrap_or(payload);
        let get = |k: &str| node.get(k).and_then(Value::as_u64);

        let uncached = get("uncachedInputTokens");
        let cache_read = get("cacheReadInputTokens");
        let cache_write = get("cacheWriteInputTokens");
        let output = get("outputTokens");
        let total = get("totalTokens");

        if let Some(v) = cache_read {
            self.usage.cache_read_tokens = v;
        }
        if let Some(v) = cache_write {
            self.usage.cache_write_tokens = v;
        }
        if let Some(v) = output {
            self.usage.output_tokens = v;
        }

        if uncached.is_some() || cache_read.is_some() || cache_write.is_some() {
            self.usage.input_tokens = uncached.unwrap_or(0)
                + self.usage.cache_read_tokens
                + self.usage.cache_write_tokens;
        } else if let Some(total) = total {
            // Only a grand total: derive input by subtraction.
            self.usage.input_tokens = total.saturating_sub(self.usage.output_tokens);
        }
    }

    fn on_metering(&mut self, payload: &Value) {
        let credits = payload
            .get("credits")
            .or_else(|| payload.get("usage"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        self.usage.credits += credits;
    }

    fn on_web_links(&mut self, payload: &Value) -> Vec<StreamEvent> {
        let Some(links) = payload
            .get("supplementaryWebLinks")
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };
        let mut rendered = String::new();
        for link in links {
            let url = link.get("url").and_then(Value::as_str).unwrap_or("");
            if url.is_empty() {
                continue;
            }
            let title = link.get("title").and_then(Value::as_str).unwrap_or(url);
            rendered.push_str(&format!("\n- [{}]({})", title, url));
        }
        if rendered.is_empty() {
            Vec::new()
        } else {
            vec![StreamEvent::TextDelta(format!("\n\nSources:{}\n", rendered))]
        }
    }

    fn on_exception(&mut self, event_type: &str, payload: &Value) -> Vec<StreamEvent> {
        let detail = payload
            .get("__type")
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(event_type);
        if detail.contains("ContentLengthExceeded") || event_type.contains("ContentLengthExceeded")
        {
            tracing::warn!("upstream reported content length exceeded mid-stream");
            return vec![StreamEvent::ContentLengthExceeded];
        }
        tracing::warn!(event_type, detail, "upstream exception event");
        Vec::new()
    }

    fn prune_stale_buffers(&mut self) {
        let stale: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, b)| b.last_touched.elapsed().as_secs() > TOOL_BUFFER_STALE_SECS)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            tracing::warn!(tool_use_id = %id, "pruning stale tool buffer");
            self.tools.remove(&id);
            self.tool_order.retain(|x| x != &id);
        }
    }
}

fn segment_event(seg: Segment) -> StreamEvent {
    match seg {
        Segment::Text(s) => StreamEvent::TextDelta(s),
        Segment::Thinking(s) => StreamEvent::ThinkingDelta(s),
    }
}

/// Parse tool input, attempting a brace-balancing repair on malformed
/// fragments; `{}` when nothing salvageable remains.
pub fn parse_or_repair(input: &str) -> Value {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return v;
    }
    if let Some(repaired) = repair_json(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
            tracing::debug!("repaired malformed tool input");
            return v;
        }
    }
    tracing::warn!("unrepairable tool input, substituting empty object");
    Value::Object(serde_json::Map::new())
}

/// Close dangling strings, brackets and braces on a truncated JSON
/// fragment. Returns `None` when the input doesn't even start like JSON.
fn repair_json(input: &str) -> Option<String> {
    if !input.starts_with('{') && !input.starts_with('[') {
        return None;
    }

    let mut out: String = input.to_string();
    // A truncated escape at the tail (`\`, `\u`, `\uD8..` high-surrogate
    // half) breaks the parser outright; drop it before balancing.
    if let Some(pos) = out.rfind('\\') {
        let tail = &out[pos..];
        let incomplete_unicode = tail.len() < 6 && tail.starts_with("\\u");
        let lone_high_surrogate = tail.len() == 6
            && tail[2..].chars().all(|c| c.is_ascii_hexdigit())
            && matches!(&tail[..4], "\\ud8" | "\\ud9" | "\\uda" | "\\udb" | "\\uD8" | "\\uD9" | "\\uDA" | "\\uDB");
        if tail.len() == 1 || incomplete_unicode || lone_high_surrogate {
            out.truncate(pos);
        }
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in out.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}
