//! Structured mining of a conversation prefix: artifacts touched,
//! decisions made, and the most recent context. Pure regex work, no model
//! calls, so it runs alongside batch summarization for free.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::convert::text_of;

static FILE_PATH: Lazy<Regex> = Lazy::new(|| {
    // Path-looking tokens with an extension, optionally dir-qualified.
    Regex::new(r"(?:[\w.\-]+/)+[\w.\-]+\.\w{1,8}|[\w\-]+\.(?:rs|py|ts|js|tsx|jsx|go|java|toml|json|yaml|yml|md|sql|sh)\b").unwrap()
});

static DECISION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:decided to|chose|will use|going with|settled on|决定|选择|改用)[^.\n]{3,120}")
        .unwrap()
});

static CREATED_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(creat|add|wrote|new file|写入|新建|创建)").unwrap());
static DELETED_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(delet|remov|drop|删除|移除)").unwrap());
static MODIFIED_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(modif|updat|edit|chang|fix|修改|更新)").unwrap());

const MAX_DECISIONS: usize = 20;
const MAX_ARTIFACTS: usize = 40;
const BREADCRUMB_COUNT: usize = 6;
const BREADCRUMB_LEN: usize = 150;

/// Render the `Artifacts`, `Decisions` and `Recent Context` sections for
/// the combined summary.
pub fn mine_sections(messages: &[Value]) -> String {
    let texts: Vec<String> = messages
        .iter()
        .map(|m| text_of(m.get("content").unwrap_or(&Value::Null)))
        .collect();

    let mut out = String::new();

    let artifacts = mine_artifacts(&texts);
    if !artifacts.is_empty() {
        out.push_str("\n## Artifacts\n");
        for (path, tag) in artifacts {
            out.push_str(&format!("- `{}` ({})\n", path, tag));
        }
    }

    let decisions = mine_decisions(&texts);
    if !decisions.is_empty() {
        out.push_str("\n## Decisions\n");
        for d in decisions {
            out.push_str(&format!("- {}\n", d));
        }
    }

    let recent: Vec<&String> = texts.iter().rev().take(BREADCRUMB_COUNT).collect();
    if !recent.is_empty() {
        out.push_str("\n## Recent Context\n");
        for text in recent.into_iter().rev() {
            let line: String = text.chars().take(BREADCRUMB_LEN).collect();
            let line = line.replace('\n', " ");
            if !line.trim().is_empty() {
                out.push_str(&format!("- {}\n", line.trim()));
            }
        }
    }

    out
}

fn mine_artifacts(texts: &[String]) -> Vec<(String, &'static str)> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for text in texts {
        for m in FILE_PATH.find_iter(text) {
            let path = m.as_str().to_string();
            if !seen.insert(path.clone()) {
                continue;
            }
            // Tag by the nearest verb in a small window before the match.
            let window_start = text[..m.start()]
                .char_indices()
                .rev()
                .nth(80)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let window = &text[window_start..m.start()];
            let tag = if CREATED_VERB.is_match(window) {
                "created"
            } else if DELETED_VERB.is_match(window) {
                "deleted"
            } else if MODIFIED_VERB.is_match(window) {
                "modified"
            } else {
                "read"
            };
            out.push((path, tag));
            if out.len() >= MAX_ARTIFACTS {
                return out;
            }
        }
    }
    out
}

fn mine_decisions(texts: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for text in texts {
        for m in DECISION.find_iter(text) {
            let d = m.as_str().trim().to_string();
            if seen.insert(d.to_lowercase()) {
                out.push(d);
                if out.len() >= MAX_DECISIONS {
                    return out;
                }
            }
        }
    }
    out
}
