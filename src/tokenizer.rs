//! Local token estimation.
//!
//! Only consulted when the upstream fails to report `outputTokens`, and for
//! the compressor's size threshold and `/v1/messages/count_tokens`. The
//! estimate splits text into CJK and non-CJK runs: CJK scripts tokenize
//! close to one token per character, Latin text closer to one per short
//! word.

use serde_json::Value;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF       // CJK Unified Ideographs
        | 0x3400..=0x4DBF     // Extension A
        | 0x3040..=0x30FF     // Hiragana + Katakana
        | 0xAC00..=0xD7AF     // Hangul syllables
        | 0xF900..=0xFAFF     // Compatibility ideographs
    )
}

/// Estimate the token count of a text fragment.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let mut total = 0f64;
    let mut non_cjk = String::new();

    for c in text.chars() {
        if is_cjk(c) {
            total += 1.2;
        } else if c.is_whitespace() {
            total += 0.5;
            if !non_cjk.is_empty() {
                total += word_tokens(&non_cjk);
                non_cjk.clear();
            }
        } else {
            non_cjk.push(c);
        }
    }
    if !non_cjk.is_empty() {
        total += word_tokens(&non_cjk);
    }

    (total.ceil() as u64).max(1)
}

fn word_tokens(word: &str) -> f64 {
    let len = word.chars().count();
    if len <= 4 {
        1.0
    } else {
        (len as f64 / 3.5).ceil()
    }
}

/// Rough token estimate for a whole message list (either dialect).
/// Counts text, tool-call arguments and a small per-message overhead.
pub fn estimate_messages(messages: &[Value]) -> u64 {
    let mut total = 0u64;
    for msg in messages {
        total += 4;
        total += estimate_tokens(msg.get("role").and_then(Value::as_str).unwrap_or(""));
        total += estimate_content(msg.get("content"));
        if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
            for tc in calls {
                total += 4;
                if let Some(f) = tc.get("function") {
                    total += estimate_tokens(f.get("name").and_then(Value::as_str).unwrap_or(""));
                    total +=
                        estimate_tokens(f.get("arguments").and_then(Value::as_str).unwrap_or(""));
                }
            }
        }
    }
    total + 3
}

fn estimate_content(content: Option<&Value>) -> u64 {
    match content {
        Some(Value::String(s)) => estimate_tokens(s),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    estimate_tokens(item.get("text").and_then(Value::as_str).unwrap_or(""))
                }
                Some("image_url") | Some("image") => 100,
                Some("tool_result") => estimate_content(item.get("content")),
                _ => estimate_tokens(&item.to_string()) / 2,
            })
            .sum(),
        _ => 0,
    }
}
