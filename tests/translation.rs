//! Translation-layer properties: history sanitization invariants, thinking
//! parser chunk invariance, and the canonical payload shape for the
//! documented tool-call scenario.

use kirogate::convert::history::{self, Role, Turn};
use kirogate::convert::tools::ToolConverter;
use kirogate::convert::{prepare_openai, ConversationIds, DegradeTier};
use kirogate::models::kiro::{HistoryEntry, ToolResult, ToolUse};
use kirogate::models::openai::ChatCompletionRequest;
use kirogate::stream::thinking::{Segment, ThinkingParser};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod sanitize_properties {
    use super::*;

    /// Build a pseudo-random mess of turns: duplicate roles, empty texts,
    /// orphan tool uses and results.
    fn arbitrary_turns(rng: &mut StdRng, len: usize) -> Vec<Turn> {
        let mut turns = Vec::new();
        for i in 0..len {
            let roll: u8 = rng.gen_range(0..6);
            let turn = match roll {
                0 => Turn::user(""),
                1 => Turn::user(format!("question {}", i)),
                2 => Turn::assistant(""),
                3 => Turn::assistant(format!("answer {}", i)),
                4 => {
                    let mut t = Turn::assistant("calling");
                    t.tool_uses.push(ToolUse {
                        tool_use_id: format!("u{}", rng.gen_range(0..len)),
                        name: "tool".into(),
                        input: serde_json::json!({}),
                    });
                    t
                }
                _ => {
                    let mut t = Turn::user("");
                    t.tool_results
                        .push(ToolResult::success(format!("u{}", rng.gen_range(0..len)), "out"));
                    t
                }
            };
            turns.push(turn);
        }
        turns
    }

    fn assert_invariants(turns: &[Turn]) {
        // Starts with user, strictly alternates.
        assert_eq!(turns.first().map(|t| t.role), Some(Role::User));
        for pair in turns.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "roles must alternate");
        }
        // Every tool use is paired with a later result, or sits on the
        // final turn; every result has an earlier use.
        for (i, turn) in turns.iter().enumerate() {
            for tool_use in &turn.tool_uses {
                let paired = turns[i + 1..].iter().any(|t| {
                    t.tool_results
                        .iter()
                        .any(|r| r.tool_use_id == tool_use.tool_use_id)
                });
                assert!(
                    paired || i == turns.len() - 1,
                    "orphan tool use {} at {}",
                    tool_use.tool_use_id,
                    i
                );
            }
            for result in &turn.tool_results {
                let paired = turns[..i].iter().any(|t| {
                    t.tool_uses
                        .iter()
                        .any(|u| u.tool_use_id == result.tool_use_id)
                });
                assert!(paired, "orphan tool result {} at {}", result.tool_use_id, i);
            }
            // No empty text unless the turn carries tool payloads (tool
            // results, or the single-space placeholder next to tool uses).
            if turn.text.trim().is_empty() {
                assert!(
                    !turn.tool_results.is_empty() || !turn.tool_uses.is_empty(),
                    "empty text without tool payload at {}",
                    i
                );
            }
        }
    }

    #[test]
    fn sanitized_histories_satisfy_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let len = rng.gen_range(1..25);
            let sanitized = history::sanitize(arbitrary_turns(&mut rng, len));
            assert_invariants(&sanitized);
        }
    }

    #[test]
    fn sanitize_is_idempotent_on_arbitrary_input() {
        let mut rng = StdRng::seed_from_u64(0xfeed);
        for _ in 0..50 {
            let len = rng.gen_range(1..25);
            let once = history::sanitize(arbitrary_turns(&mut rng, len));
            let twice = history::sanitize(once.clone());
            assert_eq!(once.len(), twice.len());
            for (a, b) in once.iter().zip(twice.iter()) {
                assert_eq!(a.role, b.role);
                assert_eq!(a.text, b.text);
                assert_eq!(a.tool_uses.len(), b.tool_uses.len());
                assert_eq!(a.tool_results.len(), b.tool_results.len());
            }
        }
    }
}

mod thinking_properties {
    use super::*;

    fn run_chunked(input: &str, cuts: &[usize]) -> (String, String) {
        let mut parser = ThinkingParser::new();
        let mut text = String::new();
        let mut thinking = String::new();
        let mut absorb = |segments: Vec<Segment>| {
            for seg in segments {
                match seg {
                    Segment::Text(s) => text.push_str(&s),
                    Segment::Thinking(s) => thinking.push_str(&s),
                }
            }
        };
        let mut prev = 0;
        for &cut in cuts {
            absorb(parser.push(&input[prev..cut]));
            prev = cut;
        }
        absorb(parser.push(&input[prev..]));
        absorb(parser.flush());
        (text, thinking)
    }

    #[test]
    fn arbitrary_chunking_matches_joined_parse() {
        let inputs = [
            "plain answer with no tags at all",
            "<thinking>short</thinking>\n\nanswer",
            "lead <thinking>a`</thinking>`quoted</thinking>\n\ntail",
            "<thinking>unterminated reasoning stream",
            "text `<thinking>` looks quoted here",
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for input in inputs {
            let joined = run_chunked(input, &[]);
            for _ in 0..40 {
                let mut cuts: Vec<usize> = (0..rng.gen_range(1..5))
                    .map(|_| rng.gen_range(1..input.len()))
                    .filter(|i| input.is_char_boundary(*i))
                    .collect();
                cuts.sort_unstable();
                cuts.dedup();
                let chunked = run_chunked(input, &cuts);
                assert_eq!(chunked, joined, "input {:?} cuts {:?}", input, cuts);
            }
        }
    }
}

mod payload_shape {
    use super::*;

    fn prepare(body: serde_json::Value) -> kirogate::convert::PreparedConversation {
        let request: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        prepare_openai(&request, &ConversationIds::new(), &ToolConverter::new()).unwrap()
    }

    /// The documented tool-call request: tools ride in the current
    /// message context with the full specification attached.
    #[test]
    fn tool_request_payload_carries_tool_specs() {
        let prepared = prepare(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {
                "name": "t", "description": "T", "parameters": {"type": "object"}
            }}],
        }));
        let payload = prepared.to_payload("AI_EDITOR", "vibe", Some("arn:profile"), DegradeTier::Full);
        let wire = serde_json::to_value(&payload).unwrap();

        assert_eq!(wire["profileArn"], "arn:profile");
        let tools = &wire["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"];
        assert_eq!(tools[0]["toolSpecification"]["name"], "t");
        assert_eq!(tools[0]["toolSpecification"]["description"], "T");
        assert_eq!(
            tools[0]["toolSpecification"]["inputSchema"]["json"]["type"],
            "object"
        );
    }

    #[test]
    fn history_serializes_alternating_wire_entries() {
        let prepared = prepare(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "rules"},
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"},
            ],
        }));
        let payload = prepared.to_payload("AI_EDITOR", "vibe", None, DegradeTier::Full);

        let mut expect_user = true;
        for entry in &payload.conversation_state.history {
            match entry {
                HistoryEntry::UserInputMessage(_) => assert!(expect_user),
                HistoryEntry::AssistantResponseMessage(_) => assert!(!expect_user),
            }
            expect_user = !expect_user;
        }
        // System lifting adds the opening exchange.
        assert_eq!(payload.conversation_state.history.len(), 4);
    }
}
