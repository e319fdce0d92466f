//! Format translation: OpenAI / Anthropic requests → canonical upstream
//! payloads.

pub mod history;
pub mod response;
pub mod tools;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config;
use crate::errors::AppError;
use crate::models::anthropic::MessagesRequest;
use crate::models::kiro::{
    AssistantResponseMessage, ConversationState, CurrentMessage, HistoryEntry, ImageBlock,
    ImageSource, KiroPayload, ToolEntry, ToolResult, ToolUse, UserInputMessage,
    UserInputMessageContext,
};
use crate::models::openai::ChatCompletionRequest;
use history::{Role, Turn};
use tools::{ToolConverter, ToolDef};

pub const DEFAULT_THINKING_BUDGET: u64 = 200_000;

/// Prepended to the current message whenever tools are declared.
const TOOL_SIZE_ADVISORY: &str = "<tool_usage_notes>Tool descriptions are truncated past 10237 characters and tool inputs are capped at 1 MiB; keep tool calls compact and split large file writes into multiple calls.</tool_usage_notes>";

// ── Conversation-id mapping ─────────────────────────────────────

/// `session id → conversation id` LRU so one client session maps to one
/// upstream conversation (bounded at 500 sessions).
pub struct ConversationIds {
    inner: Mutex<ConversationIdsInner>,
}

struct ConversationIdsInner {
    map: HashMap<String, String>,
    order: Vec<String>,
}

impl Default for ConversationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationIds {
    const CAP: usize = 500;

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConversationIdsInner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Stable id for a session, or a fresh UUID for anonymous requests.
    pub fn resolve(&self, session: Option<&str>) -> String {
        let Some(session) = session.filter(|s| !s.is_empty()) else {
            return uuid::Uuid::new_v4().to_string();
        };
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.map.get(session) {
            let existing = existing.clone();
            inner.order.retain(|s| s != session);
            inner.order.push(session.to_string());
            return existing;
        }
        let id = uuid::Uuid::new_v4().to_string();
        inner.map.insert(session.to_string(), id.clone());
        inner.order.push(session.to_string());
        if inner.order.len() > Self::CAP {
            let evicted = inner.order.remove(0);
            inner.map.remove(&evicted);
        }
        id
    }
}

// ── Thinking directive ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ThinkingDirective {
    pub adaptive: bool,
    pub budget: u64,
    pub effort: Option<String>,
}

fn effort_budget(effort: &str) -> u64 {
    match effort {
        "low" => 1_280,
        "medium" => 2_048,
        "high" => 4_096,
        _ => DEFAULT_THINKING_BUDGET,
    }
}

fn openai_thinking(req: &ChatCompletionRequest) -> Option<ThinkingDirective> {
    let implied = config::model_implies_thinking(&req.model);
    let effort = req
        .reasoning_effort
        .clone()
        .or_else(|| req.reasoning.as_ref().and_then(|r| r.effort.clone()));
    let explicit_budget = req.reasoning.as_ref().and_then(|r| r.max_tokens);
    // Some shims send a bare boolean override.
    let override_on = req
        .extra
        .get("enable_thinking")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !(implied || effort.is_some() || explicit_budget.is_some() || override_on) {
        return None;
    }

    let budget = explicit_budget
        .or_else(|| effort.as_deref().map(effort_budget))
        .unwrap_or(DEFAULT_THINKING_BUDGET)
        .min(DEFAULT_THINKING_BUDGET);

    Some(ThinkingDirective {
        adaptive: false,
        budget,
        effort,
    })
}

fn anthropic_thinking(req: &MessagesRequest) -> Option<ThinkingDirective> {
    let implied = config::model_implies_thinking(&req.model);
    let from_config = req
        .thinking
        .as_ref()
        .filter(|t| matches!(t.kind.as_str(), "enabled" | "adaptive"));

    if from_config.is_none() && !implied {
        return None;
    }

    let adaptive = from_config.is_some_and(|t| t.kind == "adaptive");
    let budget = from_config
        .and_then(|t| t.budget_tokens)
        .unwrap_or(DEFAULT_THINKING_BUDGET)
        .min(DEFAULT_THINKING_BUDGET);

    Some(ThinkingDirective {
        adaptive,
        budget,
        effort: None,
    })
}

// ── Prepared conversation ───────────────────────────────────────

/// History-degradation tier for upstream 400 recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeTier {
    Full,
    HalfHistory,
    QuarterHistory,
    NoHistory,
    /// History stripped of every tool use/result.
    Aggressive,
}

/// A fully sanitized conversation, ready to render into a payload for any
/// endpoint/credential combination.
pub struct PreparedConversation {
    pub conversation_id: String,
    /// Client-facing model name, echoed in responses.
    pub model: String,
    pub model_id: String,
    pub thinking: Option<ThinkingDirective>,
    /// Sanitized turns; the final turn is the current user message.
    turns: Vec<Turn>,
    tools: Vec<ToolEntry>,
}

impl PreparedConversation {
    pub fn thinking_enabled(&self) -> bool {
        self.thinking.is_some()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Render the canonical payload. `task_type` and `origin` come from
    /// the credential/endpoint pair; the degradation tier from the retry
    /// ladder.
    pub fn to_payload(
        &self,
        origin: &str,
        task_type: &str,
        profile_arn: Option<&str>,
        tier: DegradeTier,
    ) -> KiroPayload {
        let (history_turns, current) = self.turns.split_at(self.turns.len() - 1);
        let current = &current[0];

        let history_turns: Vec<Turn> = match tier {
            DegradeTier::Full => history_turns.to_vec(),
            DegradeTier::HalfHistory => history::truncate_history(history_turns.to_vec(), 0.5),
            DegradeTier::QuarterHistory => history::truncate_history(history_turns.to_vec(), 0.25),
            DegradeTier::NoHistory => Vec::new(),
            DegradeTier::Aggressive => history::aggressive_sanitize(history_turns.to_vec()),
        };

        let history = history_turns
            .iter()
            .map(|t| self.turn_to_entry(t, origin))
            .collect();

        let mut context = UserInputMessageContext {
            tool_results: current.tool_results.clone(),
            tools: self.tools.clone(),
        };
        if tier == DegradeTier::Aggressive {
            context.tool_results.clear();
        }

        let user_input_message = UserInputMessage {
            content: current.text.clone(),
            model_id: self.model_id.clone(),
            origin: origin.to_string(),
            images: current.images.clone(),
            user_input_message_context: if context.is_empty() {
                None
            } else {
                Some(context)
            },
        };

        KiroPayload {
            conversation_state: ConversationState {
                agent_continuation_id: uuid::Uuid::new_v4().to_string(),
                agent_task_type: task_type.to_string(),
                chat_trigger_type: "MANUAL".to_string(),
                conversation_id: self.conversation_id.clone(),
                current_message: CurrentMessage { user_input_message },
                history,
            },
            profile_arn: profile_arn.map(str::to_string),
        }
    }

    fn turn_to_entry(&self, turn: &Turn, origin: &str) -> HistoryEntry {
        match turn.role {
            Role::User => {
                let mut content = turn.text.clone();
                if !turn.images.is_empty() {
                    // History images are dropped to keep payloads small.
                    content.push_str(&format!(
                        "\n[{} image(s) omitted from history]",
                        turn.images.len()
                    ));
                }
                let context = if turn.tool_results.is_empty() {
                    None
                } else {
                    Some(UserInputMessageContext {
                        tool_results: turn.tool_results.clone(),
                        tools: Vec::new(),
                    })
                };
                HistoryEntry::UserInputMessage(UserInputMessage {
                    content,
                    model_id: self.model_id.clone(),
                    origin: origin.to_string(),
                    images: Vec::new(),
                    user_input_message_context: context,
                })
            }
            Role::Assistant => HistoryEntry::AssistantResponseMessage(AssistantResponseMessage {
                content: turn.text.clone(),
                tool_uses: turn.tool_uses.clone(),
            }),
        }
    }
}

// ── Request preparation ─────────────────────────────────────────

pub fn prepare_openai(
    req: &ChatCompletionRequest,
    conv_ids: &ConversationIds,
    converter: &ToolConverter,
) -> Result<PreparedConversation, AppError> {
    let model_id = config::internal_model_id(&req.model)
        .ok_or_else(|| AppError::UnknownModel(req.model.clone()))?;

    let mut system = String::new();
    let mut turns = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                let text = text_of(&msg.content);
                if !text.is_empty() {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&text);
                }
            }
            "tool" => {
                let mut turn = Turn::user("");
                turn.tool_results.push(ToolResult::success(
                    msg.tool_call_id.clone().unwrap_or_default(),
                    non_empty(text_of(&msg.content), "(empty result)"),
                ));
                turns.push(turn);
            }
            "assistant" => {
                let mut turn = Turn::assistant(text_of(&msg.content));
                for tc in msg.tool_calls.iter().flatten() {
                    let input = serde_json::from_str(&tc.function.arguments)
                        .unwrap_or_else(|_| Value::Object(Default::default()));
                    turn.tool_uses.push(ToolUse {
                        tool_use_id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        input,
                    });
                }
                // Anthropic-style tool_use blocks smuggled through shims.
                collect_content_blocks(&msg.content, &mut turn);
                turns.push(turn);
            }
            _ => {
                let mut turn = Turn::user(text_of(&msg.content));
                turn.images = images_of(&msg.content);
                collect_content_blocks(&msg.content, &mut turn);
                turns.push(turn);
            }
        }
    }

    let tool_defs: Vec<ToolDef> = req
        .tools
        .iter()
        .flatten()
        .filter(|t| t.kind == "function")
        .map(ToolDef::from)
        .collect();

    assemble(
        req.model.clone(),
        model_id,
        system,
        turns,
        tool_defs,
        openai_thinking(req),
        conv_ids.resolve(req.user.as_deref()),
        converter,
    )
}

pub fn prepare_anthropic(
    req: &MessagesRequest,
    conv_ids: &ConversationIds,
    converter: &ToolConverter,
) -> Result<PreparedConversation, AppError> {
    let model_id = config::internal_model_id(&req.model)
        .ok_or_else(|| AppError::UnknownModel(req.model.clone()))?;

    let system = req
        .system
        .as_ref()
        .map(|s| text_of(s))
        .unwrap_or_default();

    let mut turns = Vec::new();
    for msg in &req.messages {
        let mut turn = match msg.role.as_str() {
            "assistant" => Turn::assistant(text_of(&msg.content)),
            _ => Turn::user(text_of(&msg.content)),
        };
        turn.images = images_of(&msg.content);
        collect_content_blocks(&msg.content, &mut turn);
        turns.push(turn);
    }

    let tool_defs: Vec<ToolDef> = req.tools.iter().flatten().map(ToolDef::from).collect();

    let session = req
        .metadata
        .as_ref()
        .and_then(|m| m.user_id.as_deref());

    assemble(
        req.model.clone(),
        model_id,
        system,
        turns,
        tool_defs,
        anthropic_thinking(req),
        conv_ids.resolve(session),
        converter,
    )
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    model: String,
    model_id: &str,
    system: String,
    turns: Vec<Turn>,
    tool_defs: Vec<ToolDef>,
    thinking: Option<ThinkingDirective>,
    conversation_id: String,
    converter: &ToolConverter,
) -> Result<PreparedConversation, AppError> {
    if turns.is_empty() {
        return Err(AppError::InvalidRequest("messages must not be empty".into()));
    }

    let mut turns = history::sanitize(turns);

    // System prompt rides in as a synthetic opening exchange the upstream
    // accepts as a regular turn.
    let system = system.trim().to_string();
    if !system.is_empty() {
        let mut lifted = vec![
            Turn::user(system),
            Turn::assistant("Understood. I will follow these instructions."),
        ];
        lifted.append(&mut turns);
        turns = lifted;
    }

    // The payload's current message must be a user turn.
    if turns.last().map(|t| t.role) != Some(Role::User) {
        turns.push(Turn::user(history::FILLER_USER));
    }

    let referenced = history::referenced_tool_names(&turns);
    let tools = converter.convert(&tool_defs, &referenced);

    // Decorate the current message: timestamp, thinking directive, tool
    // sizing advisory, all ahead of the user's own text.
    let current = turns.last_mut().expect("turns checked non-empty");
    let mut prefix = format!(
        "Current time: {}\n\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    if let Some(t) = &thinking {
        prefix.push_str(&thinking_block(t));
        prefix.push_str("\n\n");
    }
    if !tools.is_empty() {
        prefix.push_str(TOOL_SIZE_ADVISORY);
        prefix.push_str("\n\n");
    }
    current.text = format!("{}{}", prefix, current.text);

    Ok(PreparedConversation {
        conversation_id,
        model,
        model_id: model_id.to_string(),
        thinking,
        turns,
        tools,
    })
}

fn thinking_block(t: &ThinkingDirective) -> String {
    if t.adaptive {
        let effort = t.effort.as_deref().unwrap_or("medium");
        format!(
            "<thinking_mode>adaptive</thinking_mode>\n<thinking_effort>{}</thinking_effort>",
            effort
        )
    } else {
        format!(
            "<thinking_mode>enabled</thinking_mode>\n<max_thinking_length>{}</max_thinking_length>",
            t.budget
        )
    }
}

// ── Content helpers ─────────────────────────────────────────────

fn non_empty(text: String, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

/// Extract plain text from either a string or an array of content parts.
pub fn text_of(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        out.push_str(part.get("text").and_then(Value::as_str).unwrap_or(""));
                    }
                    None => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            out.push_str(text);
                        } else if let Some(s) = part.as_str() {
                            out.push_str(s);
                        }
                    }
                    _ => {}
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Pull base64 images out of a content-part array (both dialects).
/// Payloads that don't decode as base64 are dropped here rather than
/// bounced by the upstream as an opaque 400.
fn images_of(content: &Value) -> Vec<ImageBlock> {
    let Value::Array(parts) = content else {
        return Vec::new();
    };
    let mut images = Vec::new();
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("image_url") => {
                let url = part
                    .pointer("/image_url/url")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if let Some(img) = parse_data_url(url) {
                    images.push(img);
                } else if !url.is_empty() {
                    tracing::warn!("unsupported or malformed image URL, skipping");
                }
            }
            Some("image") => {
                let source = part.get("source");
                let kind = source
                    .and_then(|s| s.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if kind == "base64" {
                    let media_type = source
                        .and_then(|s| s.get("media_type"))
                        .and_then(Value::as_str)
                        .unwrap_or("image/png");
                    let data = source
                        .and_then(|s| s.get("data"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if !valid_base64(data) {
                        tracing::warn!("image block with undecodable base64 data, skipping");
                        continue;
                    }
                    images.push(ImageBlock {
                        format: normalize_image_format(media_type),
                        source: ImageSource {
                            bytes: data.to_string(),
                        },
                    });
                }
            }
            _ => {}
        }
    }
    images
}

fn valid_base64(data: &str) -> bool {
    use base64::Engine as _;
    !data.is_empty() && base64::engine::general_purpose::STANDARD.decode(data).is_ok()
}

/// `data:image/<fmt>;base64,<payload>` → image block.
fn parse_data_url(url: &str) -> Option<ImageBlock> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    if !valid_base64(data) {
        return None;
    }
    let media_type = header.split(';').next().unwrap_or("image/png");
    Some(ImageBlock {
        format: normalize_image_format(media_type),
        source: ImageSource {
            bytes: data.to_string(),
        },
    })
}

fn normalize_image_format(media_type: &str) -> String {
    let fmt = media_type.split('/').nth(1).unwrap_or("png");
    match fmt {
        "jpg" => "jpeg".to_string(),
        other => other.to_string(),
    }
}

/// Pick up `tool_use` / `tool_result` blocks inside content arrays.
fn collect_content_blocks(content: &Value, turn: &mut Turn) {
    let Value::Array(parts) = content else {
        return;
    };
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("tool_use") => {
                turn.tool_uses.push(ToolUse {
                    tool_use_id: part
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: part
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: part.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            Some("tool_result") => {
                let text = part
                    .get("content")
                    .map(text_of)
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| "(empty result)".to_string());
                turn.tool_results.push(ToolResult::success(
                    part.get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    text,
                ));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn openai_req(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    fn prepare(body: Value) -> PreparedConversation {
        prepare_openai(
            &openai_req(body),
            &ConversationIds::new(),
            &ToolConverter::new(),
        )
        .unwrap()
    }

    #[test]
    fn simple_request_builds_payload() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let state = &payload.conversation_state;
        assert!(state.history.is_empty());
        assert!(state
            .current_message
            .user_input_message
            .content
            .ends_with("hi"));
        assert_eq!(
            state.current_message.user_input_message.model_id,
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
    }

    #[test]
    fn system_prompt_is_lifted_into_history() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        }));
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let history = &payload.conversation_state.history;
        assert_eq!(history.len(), 2);
        match &history[0] {
            HistoryEntry::UserInputMessage(m) => assert_eq!(m.content, "be terse"),
            _ => panic!("system must become the opening user turn"),
        }
        match &history[1] {
            HistoryEntry::AssistantResponseMessage(m) => {
                assert!(m.content.starts_with("Understood."))
            }
            _ => panic!("ack turn missing"),
        }
    }

    #[test]
    fn unknown_model_is_rejected() {
        let req = openai_req(json!({
            "model": "llama-70b",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let err = prepare_openai(&req, &ConversationIds::new(), &ToolConverter::new());
        assert!(matches!(err, Err(AppError::UnknownModel(_))));
    }

    #[test]
    fn thinking_tags_are_injected() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hard problem"}],
            "reasoning_effort": "high",
        }));
        assert!(prep.thinking_enabled());
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let content = &payload.conversation_state.current_message.user_input_message.content;
        assert!(content.contains("<thinking_mode>enabled</thinking_mode>"));
        assert!(content.contains("<max_thinking_length>4096</max_thinking_length>"));
        assert!(content.starts_with("Current time: "));
    }

    #[test]
    fn anthropic_adaptive_thinking_uses_effort_tag() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "x"}],
            "thinking": {"type": "adaptive"},
        }))
        .unwrap();
        let prep =
            prepare_anthropic(&req, &ConversationIds::new(), &ToolConverter::new()).unwrap();
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let content = &payload.conversation_state.current_message.user_input_message.content;
        assert!(content.contains("<thinking_mode>adaptive</thinking_mode>"));
        assert!(content.contains("<thinking_effort>"));
        assert!(!content.contains("<max_thinking_length>"));
    }

    #[test]
    fn budget_clamps_to_maximum() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "x"}],
            "reasoning": {"max_tokens": 999_999_999u64},
        }));
        assert_eq!(prep.thinking.as_ref().unwrap().budget, DEFAULT_THINKING_BUDGET);
    }

    #[test]
    fn tool_results_merge_into_next_user_message() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "run it"},
                {"role": "assistant", "content": "", "tool_calls": [
                    {"id": "u1", "type": "function", "function": {"name": "run", "arguments": "{\"cmd\":\"ls\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "u1", "content": "files..."},
                {"role": "user", "content": "now summarize"},
            ],
        }));
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let state = &payload.conversation_state;
        // history: user, assistant(tool_use); current: user with toolResults
        assert_eq!(state.history.len(), 2);
        let current = &state.current_message.user_input_message;
        let results = current.tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "u1");
        assert!(current.content.contains("now summarize"));
    }

    #[test]
    fn trailing_assistant_message_moves_to_history() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "partial answer"},
            ],
        }));
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let state = &payload.conversation_state;
        assert_eq!(state.history.len(), 2);
        assert!(state
            .current_message
            .user_input_message
            .content
            .contains(history::FILLER_USER));
    }

    #[test]
    fn data_url_images_attach_to_current_message() {
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/jpg;base64,QUJD"}},
            ]}],
        }));
        let payload = prep.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);
        let current = &payload.conversation_state.current_message.user_input_message;
        assert_eq!(current.images.len(), 1);
        assert_eq!(current.images[0].format, "jpeg");
        assert_eq!(current.images[0].source.bytes, "QUJD");
    }

    #[test]
    fn conversation_id_is_stable_per_session() {
        let ids = ConversationIds::new();
        let a1 = ids.resolve(Some("session-a"));
        let a2 = ids.resolve(Some("session-a"));
        let b = ids.resolve(Some("session-b"));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_ne!(ids.resolve(None), ids.resolve(None));
    }

    #[test]
    fn degrade_tiers_shrink_history() {
        let mut messages = Vec::new();
        for i in 0..40 {
            messages.push(json!({"role": "user", "content": format!("q{}", i)}));
            messages.push(json!({"role": "assistant", "content": format!("a{}", i)}));
        }
        messages.push(json!({"role": "user", "content": "latest"}));
        let prep = prepare(json!({
            "model": "claude-sonnet-4-5",
            "messages": messages,
        }));

        let full = prep
            .to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full)
            .conversation_state
            .history
            .len();
        let half = prep
            .to_payload("AI_EDITOR", "vibe", None, DegradeTier::HalfHistory)
            .conversation_state
            .history
            .len();
        let none = prep
            .to_payload("AI_EDITOR", "vibe", None, DegradeTier::NoHistory)
            .conversation_state
            .history
            .len();
        assert!(half < full);
        assert_eq!(none, 0);
    }
}
