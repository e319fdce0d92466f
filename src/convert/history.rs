//! Conversation history sanitization.
//!
//! The upstream is strict about conversation shape: history must start
//! with a user turn, alternate user/assistant exactly, pair every tool use
//! with a following tool result, and never carry empty message text. Both
//! inbound dialects get normalized into [`Turn`]s and pushed through
//! [`sanitize`], which is idempotent: re-sanitizing sanitized history is
//! the identity.

use std::collections::HashSet;

use crate::models::kiro::{ImageBlock, ToolResult, ToolUse};

pub const FILLER_USER: &str = "Continue";
pub const FILLER_ASSISTANT: &str = "understood";
pub const EMPTY_ASSISTANT_TEXT: &str = "I understand.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// Dialect-neutral conversation turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub images: Vec<ImageBlock>,
    pub tool_uses: Vec<ToolUse>,
    pub tool_results: Vec<ToolResult>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            images: Vec::new(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

/// Normalize a turn sequence into upstream-acceptable shape.
pub fn sanitize(turns: Vec<Turn>) -> Vec<Turn> {
    let turns = merge_tool_result_runs(turns);
    let turns = drop_orphan_tool_messages(turns);
    let turns = enforce_alternation(turns);
    fill_empty_text(turns)
}

/// Merge consecutive user turns that only carry tool results into one, and
/// drop duplicate tool-result ids (first occurrence wins).
fn merge_tool_result_runs(turns: Vec<Turn>) -> Vec<Turn> {
    let mut out: Vec<Turn> = Vec::with_capacity(turns.len());
    let mut seen_result_ids = HashSet::new();

    for mut turn in turns {
        turn.tool_results
            .retain(|r| seen_result_ids.insert(r.tool_use_id.clone()));

        if turn.role == Role::User {
            if let Some(prev) = out.last_mut() {
                // Tool results travel in the next user message; fold a
                // result-carrying turn into its user-text neighbor.
                if prev.role == Role::User
                    && (!prev.tool_results.is_empty() || !turn.tool_results.is_empty())
                {
                    prev.tool_results.append(&mut turn.tool_results);
                    if !turn.text.is_empty() {
                        if !prev.text.is_empty() {
                            prev.text.push('\n');
                        }
                        prev.text.push_str(&turn.text);
                    }
                    prev.images.append(&mut turn.images);
                    continue;
                }
            }
        }
        out.push(turn);
    }
    out
}

/// Strip tool uses with no later matching result (unless they sit on the
/// final turn, where the result legitimately hasn't arrived yet) and
/// results with no earlier matching use.
fn drop_orphan_tool_messages(mut turns: Vec<Turn>) -> Vec<Turn> {
    let final_idx = turns.len().checked_sub(1);

    // Pass 1: collect result ids per position so uses can look ahead.
    let result_positions: Vec<(usize, String)> = turns
        .iter()
        .enumerate()
        .flat_map(|(i, t)| {
            t.tool_results
                .iter()
                .map(move |r| (i, r.tool_use_id.clone()))
        })
        .collect();

    let mut use_positions: Vec<(usize, String)> = Vec::new();
    for (i, turn) in turns.iter_mut().enumerate() {
        if turn.role != Role::Assistant {
            continue;
        }
        let keep_unpaired = Some(i) == final_idx;
        turn.tool_uses.retain(|u| {
            let paired = result_positions
                .iter()
                .any(|(j, id)| *j > i && id == &u.tool_use_id);
            if paired || keep_unpaired {
                use_positions.push((i, u.tool_use_id.clone()));
                true
            } else {
                false
            }
        });
    }

    for (i, turn) in turns.iter_mut().enumerate() {
        if turn.role != Role::User {
            continue;
        }
        turn.tool_results.retain(|r| {
            use_positions
                .iter()
                .any(|(j, id)| *j < i && id == &r.tool_use_id)
        });
    }

    turns
}

/// Insert filler turns so roles strictly alternate, starting with user.
fn enforce_alternation(turns: Vec<Turn>) -> Vec<Turn> {
    let mut out: Vec<Turn> = Vec::with_capacity(turns.len());
    for turn in turns {
        if out.is_empty() && turn.role == Role::Assistant {
            out.push(Turn::user(FILLER_USER));
        }
        if let Some(prev) = out.last() {
            if prev.role == turn.role {
                match turn.role {
                    Role::User => out.push(Turn::assistant(FILLER_ASSISTANT)),
                    Role::Assistant => out.push(Turn::user(FILLER_USER)),
                }
            }
        }
        out.push(turn);
    }
    out
}

fn fill_empty_text(mut turns: Vec<Turn>) -> Vec<Turn> {
    for turn in &mut turns {
        if !turn.text.trim().is_empty() {
            continue;
        }
        match turn.role {
            Role::Assistant => {
                turn.text = if turn.tool_uses.is_empty() {
                    EMPTY_ASSISTANT_TEXT.to_string()
                } else {
                    // Upstream rejects a truly empty string next to toolUses.
                    " ".to_string()
                };
            }
            Role::User => {
                if turn.tool_results.is_empty() {
                    turn.text = FILLER_USER.to_string();
                }
            }
        }
    }
    turns
}

/// Tool names referenced anywhere in the turns (for placeholder specs).
pub fn referenced_tool_names(turns: &[Turn]) -> HashSet<String> {
    turns
        .iter()
        .flat_map(|t| t.tool_uses.iter().map(|u| u.name.clone()))
        .filter(|n| !n.is_empty())
        .collect()
}

/// Strip all tool uses and results from every turn (aggressive 400
/// recovery), then re-run the normal pipeline.
pub fn aggressive_sanitize(mut turns: Vec<Turn>) -> Vec<Turn> {
    for turn in &mut turns {
        turn.tool_uses.clear();
        turn.tool_results.clear();
    }
    sanitize(turns)
}

/// Keep roughly the last `keep_ratio` of turns for content-length
/// recovery, then repair the shape again.
pub fn truncate_history(turns: Vec<Turn>, keep_ratio: f64) -> Vec<Turn> {
    if keep_ratio <= 0.0 {
        return Vec::new();
    }
    let keep = ((turns.len() as f64) * keep_ratio).ceil() as usize;
    let start = turns.len().saturating_sub(keep);
    sanitize(turns[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_use(id: &str) -> ToolUse {
        ToolUse {
            tool_use_id: id.into(),
            name: "tool".into(),
            input: json!({}),
        }
    }

    fn assistant_with_use(id: &str) -> Turn {
        let mut t = Turn::assistant("calling");
        t.tool_uses.push(tool_use(id));
        t
    }

    fn user_with_result(id: &str) -> Turn {
        let mut t = Turn::user("");
        t.tool_results.push(ToolResult::success(id, "out"));
        t
    }

    #[test]
    fn alternation_is_enforced() {
        let turns = sanitize(vec![
            Turn::user("a"),
            Turn::user("b"),
            Turn::assistant("c"),
            Turn::assistant("d"),
        ]);
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(turns[1].text, FILLER_ASSISTANT);
        assert_eq!(turns[4].text, FILLER_USER);
    }

    #[test]
    fn leading_assistant_gets_user_filler() {
        let turns = sanitize(vec![Turn::assistant("hello")]);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, FILLER_USER);
    }

    #[test]
    fn orphan_tool_use_is_stripped() {
        let turns = sanitize(vec![
            Turn::user("q"),
            assistant_with_use("orphan"),
            Turn::user("next question"),
            Turn::assistant("answer"),
        ]);
        // "orphan" never got a result and is not the last assistant turn.
        assert!(turns.iter().all(|t| t.tool_uses.is_empty()));
    }

    #[test]
    fn trailing_tool_use_survives() {
        let turns = sanitize(vec![Turn::user("q"), assistant_with_use("pending")]);
        assert_eq!(turns[1].tool_uses.len(), 1);
    }

    #[test]
    fn orphan_tool_result_is_dropped() {
        let turns = sanitize(vec![Turn::user("q"), Turn::assistant("a"), user_with_result("ghost")]);
        assert!(turns.iter().all(|t| t.tool_results.is_empty()));
    }

    #[test]
    fn paired_tools_survive() {
        let turns = sanitize(vec![
            Turn::user("q"),
            assistant_with_use("u1"),
            user_with_result("u1"),
        ]);
        assert_eq!(turns[1].tool_uses.len(), 1);
        assert_eq!(turns[2].tool_results.len(), 1);
    }

    #[test]
    fn duplicate_result_ids_first_wins() {
        let mut dup = user_with_result("u1");
        dup.tool_results.push(ToolResult::success("u1", "second copy"));
        let turns = sanitize(vec![Turn::user("q"), assistant_with_use("u1"), dup]);
        assert_eq!(turns[2].tool_results.len(), 1);
        assert_eq!(turns[2].tool_results[0].content[0].text, "out");
    }

    #[test]
    fn empty_text_policy() {
        let turns = sanitize(vec![
            Turn::user(""),
            Turn::assistant(""),
            Turn::user("q"),
            assistant_with_use("u1"),
        ]);
        assert_eq!(turns[0].text, FILLER_USER);
        assert_eq!(turns[1].text, EMPTY_ASSISTANT_TEXT);
        // Pending tool call keeps placeholder space text.
        let last = turns.last().unwrap();
        assert_eq!(last.text, "calling");
    }

    #[test]
    fn empty_assistant_with_tool_use_gets_space() {
        let mut a = Turn::assistant("");
        a.tool_uses.push(tool_use("u1"));
        let turns = sanitize(vec![Turn::user("q"), a]);
        assert_eq!(turns[1].text, " ");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let input = vec![
            Turn::user(""),
            Turn::user("two in a row"),
            assistant_with_use("u1"),
            user_with_result("u1"),
            Turn::assistant(""),
            Turn::assistant("done"),
            Turn::user("latest"),
        ];
        let once = sanitize(input);
        let twice = sanitize(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.text, b.text);
            assert_eq!(a.tool_uses.len(), b.tool_uses.len());
            assert_eq!(a.tool_results.len(), b.tool_results.len());
        }
    }

    #[test]
    fn aggressive_sanitize_strips_all_tools() {
        let turns = aggressive_sanitize(vec![
            Turn::user("q"),
            assistant_with_use("u1"),
            user_with_result("u1"),
        ]);
        assert!(turns.iter().all(|t| t.tool_uses.is_empty() && t.tool_results.is_empty()));
        // The tool-result-only user turn lost its payload; it must have
        // filler text now.
        assert!(turns.iter().all(|t| !t.text.is_empty()));
    }

    #[test]
    fn truncation_keeps_tail_and_repairs() {
        let mut turns = Vec::new();
        for i in 0..20 {
            turns.push(Turn::user(format!("q{}", i)));
            turns.push(Turn::assistant(format!("a{}", i)));
        }
        let half = truncate_history(turns.clone(), 0.5);
        assert!(half.len() <= 21);
        assert_eq!(half[0].role, Role::User);
        assert_eq!(truncate_history(turns, 0.0).len(), 0);
    }
}
