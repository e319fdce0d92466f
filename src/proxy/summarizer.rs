//! Compressor → upstream bridge: summarization prompts ride through the
//! same credential pool and decoder as regular traffic, on the cheapest
//! thinking-capable model.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::compress::{Summarizer, SUMMARY_MODEL};
use crate::convert::tools::ToolConverter;
use crate::convert::{prepare_openai, ConversationIds};
use crate::models::openai::ChatCompletionRequest;
use crate::pool::CredentialPool;
use crate::upstream::decoder::FrameDecoder;
use crate::upstream::events::{EventAccumulator, StreamEvent};
use crate::upstream::UpstreamClient;

pub struct UpstreamSummarizer {
    pool: Arc<CredentialPool>,
    upstream: Arc<UpstreamClient>,
    conv_ids: ConversationIds,
    tools: ToolConverter,
}

impl UpstreamSummarizer {
    pub fn new(pool: Arc<CredentialPool>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            pool,
            upstream,
            conv_ids: ConversationIds::new(),
            tools: ToolConverter::new(),
        }
    }
}

#[async_trait]
impl Summarizer for UpstreamSummarizer {
    async fn summarize(&self, prompt: String, _max_tokens: u64) -> anyhow::Result<String> {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": SUMMARY_MODEL,
            "messages": [{"role": "user", "content": prompt}],
        }))?;
        let prepared = prepare_openai(&request, &self.conv_ids, &self.tools)
            .map_err(|e| anyhow::anyhow!("summary prepare failed: {}", e))?;

        let lease = self
            .pool
            .acquire(Some(SUMMARY_MODEL))
            .ok_or_else(|| anyhow::anyhow!("no credential available for summarization"))?;

        let upstream = self
            .upstream
            .send_conversation(&lease.record, &prepared, None)
            .await
            .map_err(|e| anyhow::anyhow!("summary upstream call failed: {}", e))?;

        let mut body = upstream.response.bytes_stream();
        let mut decoder = FrameDecoder::new();
        let mut accumulator = EventAccumulator::new(false);
        let mut text = String::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("summary stream error: {}", e))?;
            for frame in decoder.feed(&chunk)? {
                for event in accumulator.handle(&frame.event_type, &frame.payload) {
                    if let StreamEvent::TextDelta(t) = event {
                        text.push_str(&t);
                    }
                }
            }
        }
        for event in accumulator.finish() {
            if let StreamEvent::TextDelta(t) = event {
                text.push_str(&t);
            }
        }

        let usage = accumulator.usage();
        self.pool
            .record_success(lease.id(), usage.input_tokens + usage.output_tokens, upstream.started.elapsed());

        if text.trim().is_empty() {
            anyhow::bail!("summary came back empty");
        }
        Ok(text)
    }
}
