//! Three-tier summary cache.
//!
//! * L1: per-conversation incremental map, populated on compute.
//! * L2: byte-budgeted LRU with per-entry TTL.
//! * L3: the durable KV store (`summaries/` namespace), pruned lazily by
//!   the maintenance job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::store::{KeyValueStore, NS_SUMMARIES};

pub const L2_BYTE_BUDGET: usize = 100 * 1024 * 1024;
pub const L2_ENTRY_CAP: usize = 500;
pub const ENTRY_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache key: conversation id plus a short digest of the first 500 chars
/// of every compressed message. Identical prefixes hash identically; any
/// drift in the first 500 chars of any message changes the key.
pub fn cache_key(conversation_id: &str, compressed_messages: &[String]) -> String {
    let mut hasher = Sha256::new();
    let joined: String = compressed_messages
        .iter()
        .map(|m| m.chars().take(500).collect::<String>())
        .collect::<Vec<_>>()
        .join("|");
    hasher.update(joined.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}:{}", conversation_id, &digest[..16])
}

struct L2Entry {
    summary: String,
    created: Instant,
}

#[derive(Default)]
struct L2Inner {
    map: HashMap<String, L2Entry>,
    /// LRU order, oldest first.
    order: Vec<String>,
    total_bytes: usize,
}

pub struct SummaryCache {
    /// conversation id → (key, summary) of the latest computation.
    l1: Mutex<HashMap<String, (String, String)>>,
    l2: Mutex<L2Inner>,
    l3: Arc<dyn KeyValueStore>,
}

impl SummaryCache {
    pub fn new(l3: Arc<dyn KeyValueStore>) -> Self {
        Self {
            l1: Mutex::new(HashMap::new()),
            l2: Mutex::new(L2Inner::default()),
            l3,
        }
    }

    pub async fn get(&self, conversation_id: &str, key: &str) -> Option<String> {
        {
            let l1 = self.l1.lock().unwrap();
            if let Some((stored_key, summary)) = l1.get(conversation_id) {
                if stored_key == key {
                    return Some(summary.clone());
                }
            }
        }

        {
            let mut l2 = self.l2.lock().unwrap();
            let expired = l2
                .map
                .get(key)
                .is_some_and(|e| e.created.elapsed() > ENTRY_TTL);
            if expired {
                Self::evict(&mut l2, key);
            } else if let Some(entry) = l2.map.get(key) {
                let summary = entry.summary.clone();
                l2.order.retain(|k| k != key);
                l2.order.push(key.to_string());
                return Some(summary);
            }
        }

        match self.l3.get(NS_SUMMARIES, key).await {
            Ok(Some(value)) => {
                let summary = value.get("summary")?.as_str()?.to_string();
                self.put_l2(key, &summary);
                Some(summary)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("summary cache L3 read failed: {}", e);
                None
            }
        }
    }

    /// Store a computed summary in every tier.
    pub async fn put(&self, conversation_id: &str, key: &str, summary: &str) {
        self.l1.lock().unwrap().insert(
            conversation_id.to_string(),
            (key.to_string(), summary.to_string()),
        );
        self.put_l2(key, summary);
        let record = json!({
            "summary": summary,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        if let Err(e) = self.l3.put(NS_SUMMARIES, key, &record).await {
            tracing::warn!("summary cache L3 write failed: {}", e);
        }
    }

    fn put_l2(&self, key: &str, summary: &str) {
        let mut l2 = self.l2.lock().unwrap();
        Self::evict(&mut l2, key);
        while l2.order.len() >= L2_ENTRY_CAP
            || (l2.total_bytes + summary.len() > L2_BYTE_BUDGET && !l2.order.is_empty())
        {
            let oldest = l2.order.remove(0);
            Self::remove_entry(&mut l2, &oldest);
        }
        l2.total_bytes += summary.len();
        l2.map.insert(
            key.to_string(),
            L2Entry {
                summary: summary.to_string(),
                created: Instant::now(),
            },
        );
        l2.order.push(key.to_string());
    }

    fn evict(l2: &mut L2Inner, key: &str) {
        if l2.map.contains_key(key) {
            l2.order.retain(|k| k != key);
            Self::remove_entry(l2, key);
        }
    }

    fn remove_entry(l2: &mut L2Inner, key: &str) {
        if let Some(entry) = l2.map.remove(key) {
            l2.total_bytes = l2.total_bytes.saturating_sub(entry.summary.len());
        }
    }

    /// Drop expired L2 entries; called from the maintenance job.
    pub fn sweep_l2(&self) -> usize {
        let mut l2 = self.l2.lock().unwrap();
        let expired: Vec<String> = l2
            .map
            .iter()
            .filter(|(_, e)| e.created.elapsed() > ENTRY_TTL)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            Self::evict(&mut l2, key);
        }
        expired.len()
    }

    /// Lazy L3 pruning, at most 50 entries per sweep.
    pub async fn prune_l3(&self) -> u64 {
        let cutoff = chrono::Utc::now().timestamp() - ENTRY_TTL.as_secs() as i64;
        match self.l3.prune_older_than(NS_SUMMARIES, cutoff, 50).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("summary cache L3 prune failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn key_is_deterministic_and_prefix_sensitive() {
        let msgs = vec!["alpha".to_string(), "beta".to_string()];
        let k1 = cache_key("conv", &msgs);
        let k2 = cache_key("conv", &msgs);
        assert_eq!(k1, k2);

        let mut changed = msgs.clone();
        changed[0] = "alphb".to_string();
        assert_ne!(k1, cache_key("conv", &changed));
        assert_ne!(k1, cache_key("other", &msgs));

        // Drift beyond the first 500 chars does not change the key.
        let long_a = vec![format!("{}{}", "x".repeat(500), "tail-one")];
        let long_b = vec![format!("{}{}", "x".repeat(500), "tail-two")];
        assert_eq!(cache_key("conv", &long_a), cache_key("conv", &long_b));
    }

    #[tokio::test]
    async fn l1_hit_by_conversation() {
        let cache = SummaryCache::new(Arc::new(SqliteStore::in_memory().await.unwrap()));
        cache.put("conv", "conv:abc", "the summary").await;
        assert_eq!(
            cache.get("conv", "conv:abc").await.as_deref(),
            Some("the summary")
        );
    }

    #[tokio::test]
    async fn l3_survives_l1_and_l2_clear() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        {
            let cache = SummaryCache::new(store.clone());
            cache.put("conv", "conv:abc", "durable").await;
        }
        // Fresh cache object: only L3 has it.
        let cache = SummaryCache::new(store);
        assert_eq!(cache.get("conv", "conv:abc").await.as_deref(), Some("durable"));
    }

    #[tokio::test]
    async fn l2_entry_cap_evicts_oldest() {
        let cache = SummaryCache::new(Arc::new(SqliteStore::in_memory().await.unwrap()));
        for i in 0..(L2_ENTRY_CAP + 5) {
            cache.put_l2(&format!("k{}", i), "s");
        }
        let l2 = cache.l2.lock().unwrap();
        assert!(l2.order.len() <= L2_ENTRY_CAP);
        assert!(!l2.map.contains_key("k0"));
    }
}
