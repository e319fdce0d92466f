//! Server-Sent Events plumbing shared by both streaming dialects.

pub mod anthropic;
pub mod openai;
pub mod thinking;

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Coalescing window: deltas are batched until a kilobyte or 16 ms
/// accumulates, whichever comes first.
pub const MICRO_BUFFER_BYTES: usize = 1024;
pub const MICRO_BUFFER_WINDOW: Duration = Duration::from_millis(16);

/// Keep-alive ping after this much write inactivity.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
/// Give up on a silent stream entirely after this long.
pub const MAX_STREAM_SILENCE: Duration = Duration::from_secs(300);

/// Buffered writer feeding the client-facing body channel.
///
/// Every write reports whether the client is still connected; a `false`
/// return must cancel the upstream request promptly.
pub struct SseSink {
    tx: mpsc::Sender<Bytes>,
    pending: String,
    last_flush: Instant,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            pending: String::new(),
            last_flush: Instant::now(),
        }
    }

    /// Queue one SSE block (already `event:`/`data:` formatted, with the
    /// trailing blank line). Returns false once the client is gone.
    pub async fn write(&mut self, block: &str) -> bool {
        self.pending.push_str(block);
        if self.pending.len() >= MICRO_BUFFER_BYTES
            || self.last_flush.elapsed() >= MICRO_BUFFER_WINDOW
        {
            return self.flush().await;
        }
        true
    }

    /// Flush anything buffered. Cheap no-op when empty.
    pub async fn flush(&mut self) -> bool {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return true;
        }
        let chunk = Bytes::from(std::mem::take(&mut self.pending));
        self.tx.send(chunk).await.is_ok()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Format a named SSE event (Anthropic dialect).
pub fn named_event(name: &str, data: &serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, data)
}

/// Format a bare data event (OpenAI dialect).
pub fn data_event(data: &serde_json::Value) -> String {
    format!("data: {}\n\n", data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_reports_disconnect() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut sink = SseSink::new(tx);
        // Push enough to cross the flush threshold.
        let big = "x".repeat(MICRO_BUFFER_BYTES + 1);
        assert!(!sink.write(&big).await);
    }

    #[tokio::test]
    async fn sink_coalesces_small_writes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = SseSink::new(tx);
        assert!(sink.write("data: a\n\n").await);
        // Under both thresholds: nothing sent yet.
        assert!(rx.try_recv().is_err());
        assert!(sink.flush().await);
        let got = rx.try_recv().unwrap();
        assert_eq!(&got[..], b"data: a\n\n");
    }
}
