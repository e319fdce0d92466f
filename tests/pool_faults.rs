//! Fault-path scenarios: cooldown escalation, quota fan-out across
//! credentials, circuit-breaker windows, and compressor caching.

use std::sync::Arc;
use std::time::Duration;

use kirogate::compress::cache::SummaryCache;
use kirogate::compress::{CompressorConfig, ContextCompressor, Summarizer};
use kirogate::convert::tools::ToolConverter;
use kirogate::convert::{prepare_openai, ConversationIds};
use kirogate::errors::{classify, ErrorCategory};
use kirogate::fault::{BreakerConfig, CircuitBreaker, CircuitState};
use kirogate::models::credential::{CredentialErrorKind, CredentialRecord};
use kirogate::pool::CredentialPool;
use kirogate::store::SqliteStore;
use kirogate::upstream::{UpstreamClient, UpstreamError};

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pool_with(ids: &[&str]) -> Arc<CredentialPool> {
    let pool = Arc::new(CredentialPool::new());
    for id in ids {
        let mut record = CredentialRecord::new(*id);
        record.access_token = format!("token-{}", id);
        record.subscription_tier = Some("pro".into());
        pool.add(record);
    }
    pool
}

mod cooldown_escalation {
    use super::*;

    /// Five consecutive errors arm a cooldown; the error count survives
    /// the cooldown, and the next error re-arms it.
    #[test]
    fn five_errors_cool_down_then_rearm() {
        let pool = pool_with(&["a", "b"]);
        for _ in 0..5 {
            pool.record_error("a", CredentialErrorKind::Other);
        }

        // While cooling, scheduling flows to "b" only.
        for _ in 0..5 {
            assert_eq!(pool.acquire(None).unwrap().id(), "b");
        }
        let record = pool.record("a").unwrap();
        assert_eq!(record.error_count, 5, "cooldown must not touch the count");

        // One more error after the window re-arms the cooldown trigger.
        pool.record_error("a", CredentialErrorKind::Other);
        assert_eq!(pool.record("a").unwrap().error_count, 6);
        assert_eq!(pool.acquire(None).unwrap().id(), "b");
    }
}

mod quota_fanout {
    use super::*;

    /// The documented two-credential 402 scenario: A hits quota, gets
    /// flagged, and the request replays on B without touching the
    /// breaker.
    #[tokio::test]
    async fn second_credential_serves_after_quota() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = pool_with(&["a", "b"]);
        let client = UpstreamClient::new("us-east-1").with_base_url(&server.uri());
        let breaker = CircuitBreaker::default();
        let request = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        let prepared =
            prepare_openai(&request, &ConversationIds::new(), &ToolConverter::new()).unwrap();

        // First credential: upstream reports quota exhaustion.
        let first = pool.acquire(None).unwrap();
        let first_id = first.id().to_string();
        let err = client
            .send_conversation(&first.record, &prepared, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Quota));
        pool.record_error(&first_id, CredentialErrorKind::Quota);
        drop(first);

        assert!(pool.record(&first_id).unwrap().quota_exhausted);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Redispatch lands on the other credential and succeeds.
        let second = pool.acquire(None).unwrap();
        assert_ne!(second.id(), first_id);
        let ok = client
            .send_conversation(&second.record, &prepared, None)
            .await
            .unwrap();
        assert_eq!(ok.response.status(), 200);
    }

    #[test]
    fn quota_classification_does_not_retry_same_credential() {
        let d = classify(Some(402), "");
        assert_eq!(d.category, ErrorCategory::Quota);
        assert!(!d.retryable);
        assert!(!d.disable_credential);
    }
}

mod breaker_windows {
    use super::*;

    /// Once OPEN, `can_execute` stays false until the reset window, then
    /// exactly one probe transitions to HALF_OPEN.
    #[test]
    fn open_is_monotonic_until_reset() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(80),
            success_threshold: 1,
        });
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..10 {
            assert!(!breaker.can_execute());
        }
        std::thread::sleep(Duration::from_millis(90));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}

mod compressor_cache {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSummarizer {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, _prompt: String, _max_tokens: u64) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok("summary of earlier discussion".into())
        }
    }

    /// The documented double-compress scenario: the second call for the
    /// same conversation must be served from cache with no model calls.
    #[tokio::test]
    async fn repeat_compression_hits_cache() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let summarizer = Arc::new(CountingSummarizer {
            calls: AtomicU64::new(0),
        });
        let compressor = ContextCompressor::new(
            SummaryCache::new(store),
            summarizer.clone(),
            CompressorConfig {
                keep_count: 30,
                ..Default::default()
            },
        );

        let messages: Vec<serde_json::Value> = (0..300)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                json!({"role": role, "content": format!("turn {} with plenty of words in it", i)})
            })
            .collect();

        let first = compressor.compress("conv-cache", messages.clone(), 0).await;
        assert!(first.len() <= 32);
        assert!(first[0]["content"]
            .as_str()
            .unwrap()
            .starts_with("[Previous conversation summary]"));
        assert_eq!(first[1]["content"], "I understand the context. Let me continue.");
        let calls_after_first = summarizer.calls.load(Ordering::Relaxed);
        assert!(calls_after_first > 0);

        let second = compressor.compress("conv-cache", messages, 0).await;
        assert_eq!(
            summarizer.calls.load(Ordering::Relaxed),
            calls_after_first,
            "cache hit must not call the model"
        );
        assert_eq!(compressor.stats.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(first.len(), second.len());
        // The preserved tail is identical.
        assert_eq!(first.last(), second.last());
    }
}

mod zero_downtime {
    use super::*;

    /// A pool where every credential is cooling still serves requests.
    #[test]
    fn exhausted_pool_falls_back() {
        let pool = pool_with(&["a", "b", "c"]);
        for id in ["a", "b", "c"] {
            for _ in 0..5 {
                pool.record_error(id, CredentialErrorKind::Other);
            }
        }
        let lease = pool.acquire(None);
        assert!(lease.is_some(), "zero-downtime fallback must yield a credential");
    }
}
