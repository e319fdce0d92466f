//! Request counters and the in-memory request log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

const LOG_CAP: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// `openai` or `anthropic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub openai_requests: AtomicU64,
    pub anthropic_requests: AtomicU64,
    pub total_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    /// Append-only ring; bounded replacement guarded by the mutex.
    log: Mutex<VecDeque<RequestLogEntry>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: RequestLogEntry) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if (200..400).contains(&entry.status) {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        match entry.dialect.as_deref() {
            Some("openai") => self.openai_requests.fetch_add(1, Ordering::Relaxed),
            Some("anthropic") => self.anthropic_requests.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.total_tokens.fetch_add(entry.tokens, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(entry.duration_ms, Ordering::Relaxed);

        let mut log = self.log.lock().unwrap();
        if log.len() >= LOG_CAP {
            log.pop_front();
        }
        log.push_back(entry);
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<RequestLogEntry> {
        let log = self.log.lock().unwrap();
        log.iter().rev().take(limit).cloned().collect()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let total = self.total_requests.load(Ordering::Relaxed);
        let avg_latency = if total > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) / total
        } else {
            0
        };
        json!({
            "total_requests": total,
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "openai_requests": self.openai_requests.load(Ordering::Relaxed),
            "anthropic_requests": self.anthropic_requests.load(Ordering::Relaxed),
            "total_tokens": self.total_tokens.load(Ordering::Relaxed),
            "avg_latency_ms": avg_latency,
        })
    }

    /// Restore counters persisted by a previous run.
    pub fn restore(&self, snapshot: &serde_json::Value) {
        let load = |k: &str| snapshot.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
        self.total_requests.store(load("total_requests"), Ordering::Relaxed);
        self.successes.store(load("successes"), Ordering::Relaxed);
        self.failures.store(load("failures"), Ordering::Relaxed);
        self.openai_requests
            .store(load("openai_requests"), Ordering::Relaxed);
        self.anthropic_requests
            .store(load("anthropic_requests"), Ordering::Relaxed);
        self.total_tokens.store(load("total_tokens"), Ordering::Relaxed);
        self.total_latency_ms
            .store(load("avg_latency_ms") * load("total_requests"), Ordering::Relaxed);
    }

    /// The log tail, newest last, for periodic persistence.
    pub fn log_snapshot(&self) -> Vec<RequestLogEntry> {
        self.log.lock().unwrap().iter().cloned().collect()
    }

    pub fn restore_logs(&self, entries: Vec<RequestLogEntry>) {
        let mut log = self.log.lock().unwrap();
        log.clear();
        log.extend(entries.into_iter().rev().take(LOG_CAP).rev());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u16) -> RequestLogEntry {
        RequestLogEntry {
            timestamp: Utc::now(),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            status,
            duration_ms: 120,
            model: Some("claude-sonnet-4-5".into()),
            dialect: Some("openai".into()),
            credential_id: Some("c1".into()),
            tokens: 15,
            error_kind: None,
        }
    }

    #[test]
    fn counters_track_status_classes() {
        let metrics = Metrics::new();
        metrics.record(entry(200));
        metrics.record(entry(500));
        let snap = metrics.snapshot();
        assert_eq!(snap["total_requests"], 2);
        assert_eq!(snap["successes"], 1);
        assert_eq!(snap["failures"], 1);
        assert_eq!(snap["total_tokens"], 30);
    }

    #[test]
    fn ring_buffer_caps_at_500() {
        let metrics = Metrics::new();
        for _ in 0..600 {
            metrics.record(entry(200));
        }
        assert_eq!(metrics.log_snapshot().len(), 500);
        assert_eq!(metrics.recent_logs(10).len(), 10);
    }
}
