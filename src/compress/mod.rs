//! Context compression: recursive LLM summarization of long histories.
//!
//! When a conversation outgrows the thresholds, the older prefix is
//! summarized (via the upstream itself, behind the [`Summarizer`] seam)
//! and replaced with a two-message synthetic exchange. Results are cached
//! three tiers deep and compressions of the same conversation are
//! single-flighted.

pub mod cache;
pub mod digest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::convert::text_of;
use crate::tokenizer;
use cache::SummaryCache;

pub const SUMMARY_MAX_TOKENS: u64 = 2048;
/// Model used for summarization: cheapest thinking-capable tier.
pub const SUMMARY_MODEL: &str = "claude-haiku-4-5";

const BATCH_MAX_MESSAGES: usize = 8;
const BATCH_MAX_CHARS: usize = 40_000;
const BATCH_CONCURRENCY: usize = 3;
const SINGLE_FLIGHT_TTL: Duration = Duration::from_secs(120);

/// How the compressor talks to a model. Production wires this to the
/// upstream dispatch; tests use canned outputs.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: String, max_tokens: u64) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    pub enabled: bool,
    pub auto_compress: bool,
    pub max_messages_per_session: usize,
    pub token_threshold: u64,
    pub keep_count: usize,
    /// How far before the keep boundary to search for a tool-safe cut.
    pub tool_lookback: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_compress: true,
            max_messages_per_session: 200,
            token_threshold: 100_000,
            keep_count: 30,
            tool_lookback: 8,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompressorStats {
    pub compressions: AtomicU64,
    pub cache_hits: AtomicU64,
    pub failures: AtomicU64,
}

pub struct ContextCompressor {
    config: Mutex<CompressorConfig>,
    cache: SummaryCache,
    summarizer: Arc<dyn Summarizer>,
    pub stats: CompressorStats,
    /// Per-conversation single-flight locks with creation times.
    inflight: Mutex<HashMap<String, (Arc<tokio::sync::Mutex<()>>, Instant)>>,
}

impl ContextCompressor {
    pub fn new(
        cache: SummaryCache,
        summarizer: Arc<dyn Summarizer>,
        config: CompressorConfig,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            cache,
            summarizer,
            stats: CompressorStats::default(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CompressorConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn set_config(&self, config: CompressorConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn should_compress(&self, messages: &[Value]) -> bool {
        let config = self.config();
        if !config.enabled || !config.auto_compress {
            return false;
        }
        messages.len() > config.max_messages_per_session
            || tokenizer::estimate_messages(messages) > config.token_threshold
    }

    /// Compress `messages`, returning the replacement list. Failures
    /// degrade silently to plain truncation.
    pub async fn compress(
        &self,
        conversation_id: &str,
        messages: Vec<Value>,
        caller_keep: usize,
    ) -> Vec<Value> {
        let config = self.config();
        let keep = config.keep_count.max(caller_keep);
        let boundary = self.safe_boundary(&messages, keep, config.tool_lookback);
        if boundary == 0 {
            return messages;
        }

        let lock = self.flight_lock(conversation_id);
        let _guard = lock.lock().await;

        let (prefix, kept) = messages.split_at(boundary);
        let prefix_texts: Vec<String> = prefix
            .iter()
            .map(|m| text_of(m.get("content").unwrap_or(&Value::Null)))
            .collect();
        let key = cache::cache_key(conversation_id, &prefix_texts);

        if let Some(summary) = self.cache.get(conversation_id, &key).await {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Self::assemble(&summary, kept);
        }

        match self.summarize_prefix(prefix).await {
            Ok(summary) => {
                self.stats.compressions.fetch_add(1, Ordering::Relaxed);
                self.cache.put(conversation_id, &key, &summary).await;
                Self::assemble(&summary, kept)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(conversation_id, "compression failed, truncating: {:#}", e);
                messages[messages.len() - keep.min(messages.len())..].to_vec()
            }
        }
    }

    fn assemble(summary: &str, kept: &[Value]) -> Vec<Value> {
        let mut out = vec![
            json!({
                "role": "user",
                "content": format!("[Previous conversation summary]\n{}", summary),
            }),
            json!({
                "role": "assistant",
                "content": "I understand the context. Let me continue.",
            }),
        ];
        out.extend_from_slice(kept);
        out
    }

    /// Find the cut closest to `len - keep` that does not split an
    /// assistant tool call from its result (the cut always lands after
    /// the matching tool-result message).
    fn safe_boundary(&self, messages: &[Value], keep: usize, lookback: usize) -> usize {
        if messages.len() <= keep {
            return 0;
        }
        let target = messages.len() - keep;
        let start = target.saturating_sub(lookback);

        let mut best = None;
        for cut in start..=target {
            if !cut_splits_tool_pair(messages, cut) {
                best = Some(cut);
            }
        }
        if let Some(cut) = best {
            return cut;
        }
        // No safe spot at or before the target: move past the pair.
        for cut in (target + 1)..(target + lookback).min(messages.len()) {
            if !cut_splits_tool_pair(messages, cut) {
                return cut;
            }
        }
        target
    }

    async fn summarize_prefix(&self, prefix: &[Value]) -> anyhow::Result<String> {
        let batches = split_batches(prefix);
        let mut batch_summaries: Vec<String> = Vec::with_capacity(batches.len());
        let mut context = String::new();

        // Windows of three run concurrently; each window chains on the
        // last summary from the one before it.
        for window in batches.chunks(BATCH_CONCURRENCY) {
            let futures: Vec<_> = window
                .iter()
                .map(|batch| {
                    let prompt = batch_prompt(batch, &context);
                    let source_chars: usize = batch.iter().map(|m| m.len()).sum();
                    async move {
                        match self
                            .summarizer
                            .summarize(prompt, SUMMARY_MAX_TOKENS)
                            .await
                        {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("batch summary failed, using raw fallback: {:#}", e);
                                raw_fallback(batch, source_chars)
                            }
                        }
                    }
                })
                .collect();
            let results = futures::future::join_all(futures).await;
            if let Some(last) = results.last() {
                context = last.chars().take(2_000).collect();
            }
            batch_summaries.extend(results);
        }

        let sections = digest::mine_sections(prefix);
        let mut combined = String::from("# Session Intent\n");
        combined.push_str(
            batch_summaries
                .first()
                .map(|s| s.lines().take(3).collect::<Vec<_>>().join(" "))
                .unwrap_or_default()
                .as_str(),
        );
        combined.push_str("\n\n# Play-by-Play\n");
        for (i, summary) in batch_summaries.iter().enumerate() {
            combined.push_str(&format!("\n### Part {}\n{}\n", i + 1, summary));
        }
        combined.push_str(&sections);

        Ok(combined)
    }

    fn flight_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        let now = Instant::now();
        inflight.retain(|_, (_, created)| now.duration_since(*created) < SINGLE_FLIGHT_TTL);
        inflight
            .entry(conversation_id.to_string())
            .or_insert_with(|| (Arc::new(tokio::sync::Mutex::new(())), now))
            .0
            .clone()
    }

    /// Expired single-flight locks and L2 entries; called every 5 minutes.
    pub async fn maintain(&self) {
        let swept = self.cache.sweep_l2();
        let pruned = self.cache.prune_l3().await;
        if swept > 0 || pruned > 0 {
            tracing::debug!(swept, pruned, "compressor cache maintenance");
        }
    }
}

/// Batch text representations: each batch ≤ 8 messages and ≤ 40k chars,
/// and a message carrying a tool call never ends a batch without its
/// neighbor (pairs stay together).
fn split_batches(prefix: &[Value]) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_chars = 0usize;

    let mut i = 0;
    while i < prefix.len() {
        // A tool-calling assistant message travels with the next message.
        let glued = has_tool_call(&prefix[i]) && i + 1 < prefix.len();
        let span = if glued { 2 } else { 1 };

        let mut text = render_message(&prefix[i]);
        if glued {
            text.push('\n');
            text.push_str(&render_message(&prefix[i + 1]));
        }

        let over_count = current.len() + span > BATCH_MAX_MESSAGES;
        let over_chars = current_chars + text.len() > BATCH_MAX_CHARS;
        if !current.is_empty() && (over_count || over_chars) {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += text.len();
        current.push(text);
        if glued {
            // Keep the message count honest for the 8-message cap.
            current.push(String::new());
        }
        i += span;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn render_message(msg: &Value) -> String {
    let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
    let mut text = text_of(msg.get("content").unwrap_or(&Value::Null));
    if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                text.push_str(&format!("\n[called tool: {}]", name));
            }
        }
    }
    format!("{}: {}", role, text)
}

/// A cut at `cut` is unsafe when it would separate a tool call (just
/// before it) from its result (at or after it).
fn cut_splits_tool_pair(messages: &[Value], cut: usize) -> bool {
    if cut == 0 || cut >= messages.len() {
        return false;
    }
    is_tool_result(&messages[cut]) || has_tool_call(&messages[cut - 1])
}

fn is_tool_result(msg: &Value) -> bool {
    msg.get("role").and_then(Value::as_str) == Some("tool")
        || matches!(msg.get("content"), Some(Value::Array(parts))
            if parts.iter().any(|p| p.get("type").and_then(Value::as_str) == Some("tool_result")))
}

fn has_tool_call(msg: &Value) -> bool {
    msg.get("tool_calls")
        .and_then(Value::as_array)
        .is_some_and(|c| !c.is_empty())
        || matches!(msg.get("content"), Some(Value::Array(parts))
            if parts.iter().any(|p| p.get("type").and_then(Value::as_str) == Some("tool_use")))
}

fn batch_prompt(batch: &[String], context: &str) -> String {
    let source: String = batch.join("\n");
    let target_chars = ((source.chars().count() as f64) * 0.15).max(200.0) as usize;
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str("Summary of the conversation so far:\n");
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "Summarize the following conversation excerpt in about {} characters. \
         Preserve concrete facts, file names, decisions and unresolved questions. \
         Answer with the summary only.\n\n{}",
        target_chars, source
    ));
    prompt
}

fn raw_fallback(batch: &[String], source_chars: usize) -> String {
    let budget = (source_chars / 6).clamp(200, 2_000);
    let joined = batch.join("\n");
    joined.chars().take(budget).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::sync::atomic::AtomicU64;

    struct StubSummarizer {
        calls: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl Summarizer for StubSummarizer {
        async fn summarize(&self, _prompt: String, _max_tokens: u64) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("model unavailable")
            }
            Ok("condensed recap of the discussion".into())
        }
    }

    async fn compressor(fail: bool) -> (ContextCompressor, Arc<StubSummarizer>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let summarizer = Arc::new(StubSummarizer {
            calls: AtomicU64::new(0),
            fail,
        });
        let config = CompressorConfig {
            max_messages_per_session: 50,
            token_threshold: 5_000,
            keep_count: 10,
            ..Default::default()
        };
        (
            ContextCompressor::new(SummaryCache::new(store), summarizer.clone(), config),
            summarizer,
        )
    }

    fn conversation(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                json!({"role": role, "content": format!("message {} talking about things", i)})
            })
            .collect()
    }

    #[tokio::test]
    async fn compresses_and_keeps_tail() {
        let (comp, stub) = compressor(false).await;
        let messages = conversation(60);
        let out = comp.compress("conv-1", messages, 0).await;

        assert!(out.len() <= 12);
        assert!(text_of(&out[0]["content"]).starts_with("[Previous conversation summary]"));
        assert_eq!(
            out[1]["content"],
            "I understand the context. Let me continue."
        );
        // Tail preserved verbatim.
        assert_eq!(out.last().unwrap()["content"], "message 59 talking about things");
        assert!(stub.calls.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn second_call_hits_cache() {
        let (comp, stub) = compressor(false).await;
        let messages = conversation(60);
        let first = comp.compress("conv-1", messages.clone(), 0).await;
        let calls_after_first = stub.calls.load(Ordering::Relaxed);
        let second = comp.compress("conv-1", messages, 0).await;

        assert_eq!(stub.calls.load(Ordering::Relaxed), calls_after_first);
        assert_eq!(comp.stats.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(text_of(&first[0]["content"]), text_of(&second[0]["content"]));
    }

    #[tokio::test]
    async fn failure_degrades_to_truncation() {
        let (comp, _) = compressor(true).await;
        let messages = conversation(60);
        let out = comp.compress("conv-1", messages, 0).await;
        // Raw fallback still produces a summary message (batch failures
        // fall back per-batch, not to whole-conversation truncation).
        assert!(!out.is_empty());
        assert!(out.len() < 60);
    }

    #[tokio::test]
    async fn short_conversations_pass_through() {
        let (comp, stub) = compressor(false).await;
        let messages = conversation(5);
        let out = comp.compress("conv-1", messages.clone(), 0).await;
        assert_eq!(out.len(), messages.len());
        assert_eq!(stub.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn batches_respect_caps() {
        let prefix: Vec<Value> = (0..30)
            .map(|i| json!({"role": "user", "content": format!("m{}", i)}))
            .collect();
        let batches = split_batches(&prefix);
        assert!(batches.iter().all(|b| b.len() <= BATCH_MAX_MESSAGES));
        let total: usize = batches.iter().map(|b| b.iter().filter(|s| !s.is_empty()).count()).sum();
        assert_eq!(total, 30);
    }

    #[test]
    fn tool_pairs_stay_in_one_batch() {
        let mut prefix = Vec::new();
        for i in 0..7 {
            prefix.push(json!({"role": "user", "content": format!("m{}", i)}));
        }
        prefix.push(json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": "run"}}],
        }));
        prefix.push(json!({"role": "tool", "content": "result"}));
        let batches = split_batches(&prefix);
        // The tool call and its result render into one glued element, so
        // no batch boundary can fall between them.
        let glued = batches
            .iter()
            .flatten()
            .find(|s| s.contains("[called tool: run]"))
            .unwrap();
        assert!(glued.contains("result"));
    }

    #[tokio::test]
    async fn should_compress_thresholds() {
        let (comp, _) = compressor(false).await;
        assert!(!comp.should_compress(&conversation(10)));
        assert!(comp.should_compress(&conversation(51)));
    }
}
