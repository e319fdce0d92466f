//! Tool definition conversion and caching.
//!
//! Tool lists tend to be identical across a session's requests, and the
//! conversion (truncation, advisory injection, schema defaulting) is pure,
//! so results are memoized by a fingerprint of names and description
//! lengths in a small TTL'd LRU.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::models::anthropic::AnthropicTool;
use crate::models::kiro::{InputSchema, ToolEntry, ToolSpecification};
use crate::models::openai::Tool;

pub const TOOL_DESCRIPTION_MAX: usize = 10_237;
pub const TOOL_NAME_MAX: usize = 64;
const CACHE_CAP: usize = 8;
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Appended to the `Write`/`Edit` tools: the upstream truncates giant
/// single-shot file payloads, so the model has to split them.
const LINE_LIMIT_ADVISORY: &str = "\nIMPORTANT: Write at most 300 lines per call. For longer files, write the first portion, then continue with additional calls that append the rest.";

/// Dialect-neutral tool definition prior to canonical conversion.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl From<&Tool> for ToolDef {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.function.name.clone(),
            description: tool.function.description.clone().unwrap_or_default(),
            schema: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(empty_schema),
        }
    }
}

impl From<&AnthropicTool> for ToolDef {
    fn from(tool: &AnthropicTool) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            schema: tool.input_schema.clone().unwrap_or_else(empty_schema),
        }
    }
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

struct CacheEntry {
    fingerprint: String,
    entries: Vec<ToolEntry>,
    created: Instant,
}

/// Process-wide conversion cache. LRU order is vec order (front = oldest).
pub struct ToolConverter {
    cache: Mutex<Vec<CacheEntry>>,
}

impl Default for ToolConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolConverter {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Convert a tool list, adding empty-schema placeholders for any
    /// `referenced` names (from history) missing a definition.
    pub fn convert(&self, defs: &[ToolDef], referenced: &HashSet<String>) -> Vec<ToolEntry> {
        let mut entries = self.convert_cached(defs);

        let present: HashSet<&str> = entries
            .iter()
            .map(|e| e.tool_specification.name.as_str())
            .collect();
        let mut missing: Vec<&String> = referenced
            .iter()
            .filter(|n| !present.contains(n.as_str()))
            .collect();
        missing.sort();
        for name in missing {
            entries.push(placeholder_entry(name));
        }
        entries
    }

    fn convert_cached(&self, defs: &[ToolDef]) -> Vec<ToolEntry> {
        if defs.is_empty() {
            return Vec::new();
        }
        let fingerprint = fingerprint(defs);

        {
            let mut cache = self.cache.lock().unwrap();
            cache.retain(|e| e.created.elapsed() < CACHE_TTL);
            if let Some(pos) = cache.iter().position(|e| e.fingerprint == fingerprint) {
                let entry = cache.remove(pos);
                let result = entry.entries.clone();
                cache.push(entry); // back to most-recent position
                return result;
            }
        }

        let entries: Vec<ToolEntry> = defs.iter().map(convert_one).collect();

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= CACHE_CAP {
            cache.remove(0);
        }
        cache.push(CacheEntry {
            fingerprint,
            entries: entries.clone(),
            created: Instant::now(),
        });
        entries
    }
}

fn convert_one(def: &ToolDef) -> ToolEntry {
    let name = truncate_name(&def.name);

    let mut description = def.description.clone();
    if matches!(name.as_str(), "Write" | "Edit") {
        description.push_str(LINE_LIMIT_ADVISORY);
    }
    if description.chars().count() > TOOL_DESCRIPTION_MAX {
        description = description.chars().take(TOOL_DESCRIPTION_MAX).collect();
    }

    let schema = if def.schema.is_object() {
        def.schema.clone()
    } else {
        empty_schema()
    };

    ToolEntry {
        tool_specification: ToolSpecification {
            name,
            description,
            input_schema: InputSchema { json: schema },
        },
    }
}

fn placeholder_entry(name: &str) -> ToolEntry {
    ToolEntry {
        tool_specification: ToolSpecification {
            name: truncate_name(name),
            description: String::new(),
            input_schema: InputSchema {
                json: empty_schema(),
            },
        },
    }
}

/// Cap tool names at 64 chars. Head truncation keeps MCP prefixes
/// (`mcp__server__...`) intact.
fn truncate_name(name: &str) -> String {
    if name.chars().count() <= TOOL_NAME_MAX {
        name.to_string()
    } else {
        name.chars().take(TOOL_NAME_MAX).collect()
    }
}

fn fingerprint(defs: &[ToolDef]) -> String {
    let mut hasher = Sha256::new();
    for def in defs {
        hasher.update(def.name.as_bytes());
        hasher.update(def.description.len().to_le_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, description: &str) -> ToolDef {
        ToolDef {
            name: name.into(),
            description: description.into(),
            schema: json!({"type": "object", "properties": {"x": {"type": "number"}}}),
        }
    }

    #[test]
    fn truncates_long_descriptions() {
        let converter = ToolConverter::new();
        let long = "d".repeat(TOOL_DESCRIPTION_MAX + 500);
        let entries = converter.convert(&[def("t", &long)], &HashSet::new());
        assert_eq!(
            entries[0].tool_specification.description.chars().count(),
            TOOL_DESCRIPTION_MAX
        );
    }

    #[test]
    fn truncates_long_names_keeping_prefix() {
        let converter = ToolConverter::new();
        let name = format!("mcp__server__{}", "x".repeat(100));
        let entries = converter.convert(&[def(&name, "d")], &HashSet::new());
        let got = &entries[0].tool_specification.name;
        assert_eq!(got.chars().count(), TOOL_NAME_MAX);
        assert!(got.starts_with("mcp__server__"));
    }

    #[test]
    fn write_and_edit_get_line_advisory() {
        let converter = ToolConverter::new();
        let entries = converter.convert(
            &[def("Write", "writes a file"), def("Read", "reads a file")],
            &HashSet::new(),
        );
        assert!(entries[0].tool_specification.description.contains("at most 300 lines"));
        assert!(!entries[1].tool_specification.description.contains("at most 300 lines"));
    }

    #[test]
    fn placeholders_for_history_references() {
        let converter = ToolConverter::new();
        let referenced: HashSet<String> = ["ghost_tool".to_string()].into();
        let entries = converter.convert(&[def("real", "d")], &referenced);
        assert_eq!(entries.len(), 2);
        let ghost = entries
            .iter()
            .find(|e| e.tool_specification.name == "ghost_tool")
            .unwrap();
        assert_eq!(ghost.tool_specification.input_schema.json["type"], "object");
    }

    #[test]
    fn cache_hits_for_identical_lists() {
        let converter = ToolConverter::new();
        let defs = vec![def("a", "d1"), def("b", "d2")];
        let first = converter.convert(&defs, &HashSet::new());
        let second = converter.convert(&defs, &HashSet::new());
        assert_eq!(first.len(), second.len());
        assert_eq!(converter.cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn cache_evicts_oldest_beyond_cap() {
        let converter = ToolConverter::new();
        for i in 0..(CACHE_CAP + 3) {
            let defs = vec![def(&format!("tool{}", i), "d")];
            converter.convert(&defs, &HashSet::new());
        }
        assert_eq!(converter.cache.lock().unwrap().len(), CACHE_CAP);
    }
}
