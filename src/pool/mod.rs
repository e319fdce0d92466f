//! Credential pool: ownership, health bookkeeping and scheduling.
//!
//! All mutation goes through one `std::sync::Mutex`; nothing async happens
//! under the lock. Acquisition is scoped: [`CredentialLease`] releases its
//! inflight slot on drop, so cancellation and error paths cannot leak.

pub mod policy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use crate::config;
use crate::models::credential::{CredentialErrorKind, CredentialRecord, CredentialState};
use policy::{Candidate, SchedulingPolicy};

pub struct Credential {
    pub record: CredentialRecord,
    pub state: CredentialState,
}

struct PoolInner {
    creds: HashMap<String, Credential>,
    /// Insertion order, for the `Priority` policy.
    order: Vec<String>,
}

pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    policy: Mutex<SchedulingPolicy>,
    error_threshold: u32,
    cooldown: Duration,
}

/// A scoped credential acquisition. Dropping the lease releases the
/// inflight slot whatever path the request took.
pub struct CredentialLease {
    pool: Arc<CredentialPool>,
    /// Snapshot taken at acquire time; token refreshes update the pool and
    /// are re-read through [`CredentialPool::record`].
    pub record: CredentialRecord,
}

impl CredentialLease {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.pool.release(&self.record.id);
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                creds: HashMap::new(),
                order: Vec::new(),
            }),
            policy: Mutex::new(SchedulingPolicy::default()),
            error_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }

    pub fn set_policy(&self, policy: SchedulingPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn policy(&self) -> SchedulingPolicy {
        *self.policy.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().creds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── CRUD ────────────────────────────────────────────────────

    pub fn add(&self, record: CredentialRecord) {
        let mut inner = self.inner.lock().unwrap();
        let id = record.id.clone();
        if !inner.creds.contains_key(&id) {
            inner.order.push(id.clone());
        }
        inner.creds.insert(
            id,
            Credential {
                record,
                state: CredentialState::default(),
            },
        );
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|x| x != id);
        inner.creds.remove(id).is_some()
    }

    pub fn record(&self, id: &str) -> Option<CredentialRecord> {
        self.inner
            .lock()
            .unwrap()
            .creds
            .get(id)
            .map(|c| c.record.clone())
    }

    /// Apply a mutation to a stored record (admin updates, token refresh).
    pub fn with_record_mut<F: FnOnce(&mut CredentialRecord)>(&self, id: &str, f: F) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.creds.get_mut(id) {
            Some(cred) => {
                f(&mut cred.record);
                true
            }
            None => false,
        }
    }

    /// New tokens from a successful refresh; clears the refresh flag.
    pub fn update_tokens(
        &self,
        id: &str,
        access_token: String,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.creds.get_mut(id) {
            cred.record.access_token = access_token;
            cred.record.expires_at = expires_at;
            cred.state.needs_refresh = false;
        }
    }

    /// A successful usage-limit probe readmits a quota-flagged credential.
    pub fn clear_quota_exhausted(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.creds.get_mut(id) {
            if cred.record.quota_exhausted {
                cred.record.quota_exhausted = false;
                tracing::info!(credential = id, "quota recovered, rejoining pool");
            }
        }
    }

    pub fn snapshot_records(&self) -> Vec<CredentialRecord> {
        self.inner
            .lock()
            .unwrap()
            .creds
            .values()
            .map(|c| c.record.clone())
            .collect()
    }

    // ── Scheduling ──────────────────────────────────────────────

    /// Pick a credential for `model`. Never returns `None` while at least
    /// one non-disabled credential exists (zero-downtime fallback).
    pub fn acquire(self: &Arc<Self>, model: Option<&str>) -> Option<CredentialLease> {
        let record = {
            let mut inner = self.inner.lock().unwrap();

            let enabled: Vec<String> = inner
                .order
                .iter()
                .filter(|id| inner.creds.get(*id).is_some_and(|c| !c.record.disabled))
                .cloned()
                .collect();
            if enabled.is_empty() {
                return None;
            }

            // Single-credential fast path: clear any cooldown rather than
            // refusing the only account we have.
            if enabled.len() == 1 {
                let cred = inner.creds.get_mut(&enabled[0]).unwrap();
                cred.state.cooldown_until = None;
                Some(self.take(cred))
            } else {
                let chosen = self.choose_available(&mut inner, &enabled, model);
                let chosen = chosen.or_else(|| self.fallback(&mut inner, &enabled));
                chosen.map(|id| {
                    let cred = inner.creds.get_mut(&id).unwrap();
                    self.take(cred)
                })
            }
        }?;

        Some(CredentialLease {
            pool: self.clone(),
            record,
        })
    }

    /// Acquire one specific credential (synthetic / BYOK mode). Ignores
    /// cooldown state: the caller owns this credential outright.
    pub fn acquire_id(self: &Arc<Self>, id: &str) -> Option<CredentialLease> {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let cred = inner.creds.get_mut(id)?;
            if cred.record.disabled {
                return None;
            }
            Some(self.take(cred))
        }?;
        Some(CredentialLease {
            pool: self.clone(),
            record,
        })
    }

    /// Acquire from a restricted id set (API-key allowlists). Falls back
    /// to normal availability rules within the subset.
    pub fn acquire_one_of(self: &Arc<Self>, ids: &[String], model: Option<&str>) -> Option<CredentialLease> {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let subset: Vec<String> = inner
                .order
                .iter()
                .filter(|id| {
                    ids.contains(id)
                        && inner.creds.get(*id).is_some_and(|c| !c.record.disabled)
                })
                .cloned()
                .collect();
            if subset.is_empty() {
                return None;
            }
            let chosen = self
                .choose_available(&mut inner, &subset, model)
                .or_else(|| self.fallback(&mut inner, &subset))?;
            let cred = inner.creds.get_mut(&chosen).unwrap();
            Some(self.take(cred))
        }?;
        Some(CredentialLease {
            pool: self.clone(),
            record,
        })
    }

    fn take(&self, cred: &mut Credential) -> CredentialRecord {
        cred.state.inflight += 1;
        cred.state.last_used = Some(Instant::now());
        cred.record.clone()
    }

    fn choose_available(
        &self,
        inner: &mut PoolInner,
        enabled: &[String],
        model: Option<&str>,
    ) -> Option<String> {
        let opus = model.is_some_and(config::is_opus_class);

        let mut candidates = Vec::new();
        for (rank, id) in enabled.iter().enumerate() {
            let cred = inner.creds.get_mut(id).unwrap();
            if cred.record.quota_exhausted
                || cred.state.in_cooldown()
                || cred.state.consecutive_errors >= self.error_threshold
                || (opus && cred.record.is_free_tier())
            {
                continue;
            }
            let recent = cred.state.recent_request_count();
            candidates.push(Candidate {
                id: id.clone(),
                rank,
                inflight: cred.state.inflight,
                recent_requests: recent,
                health_score: cred.state.health_score,
                idle_secs: cred.state.last_used.map(|t| t.elapsed().as_secs_f64()),
                avg_latency_ms: cred.state.avg_latency_ms,
                token_expires_in_secs: cred.record.expires_in_secs(),
            });
        }

        policy::select(*self.policy.lock().unwrap(), &candidates)
    }

    /// Every candidate failed availability. Degrade gracefully instead of
    /// returning nothing: soonest cooldown first, then fewest errors.
    fn fallback(&self, inner: &mut PoolInner, enabled: &[String]) -> Option<String> {
        let now = Instant::now();

        // Soonest-ending cooldown; clear it outright when under 5 s away.
        let mut best: Option<(String, Instant)> = None;
        for id in enabled {
            let cred = inner.creds.get(id).unwrap();
            if cred.record.quota_exhausted {
                continue;
            }
            if let Some(until) = cred.state.cooldown_until {
                if until > now && best.as_ref().map_or(true, |(_, b)| until < *b) {
                    best = Some((id.clone(), until));
                }
            }
        }
        if let Some((id, until)) = best {
            let cred = inner.creds.get_mut(&id).unwrap();
            if until.duration_since(now) < Duration::from_secs(5) {
                cred.state.cooldown_until = None;
            }
            tracing::warn!(credential = %id, "fallback: reusing cooling credential");
            return Some(id);
        }

        // Fewest persistent errors; halve its count as a second chance.
        let fewest = enabled
            .iter()
            .filter(|id| !inner.creds.get(*id).unwrap().record.quota_exhausted)
            .min_by_key(|id| inner.creds.get(*id).unwrap().record.error_count)
            .cloned();
        if let Some(id) = fewest {
            let cred = inner.creds.get_mut(&id).unwrap();
            cred.record.error_count /= 2;
            cred.state.consecutive_errors = 0;
            tracing::warn!(credential = %id, "fallback: halving error count");
            return Some(id);
        }

        // Everything is quota-exhausted; force any enabled credential.
        enabled.first().cloned()
    }

    pub fn release(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.creds.get_mut(id) {
            cred.state.inflight = cred.state.inflight.saturating_sub(1);
        }
    }

    // ── Outcome bookkeeping ─────────────────────────────────────

    pub fn record_success(&self, id: &str, _tokens: u64, latency: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.creds.get_mut(id) {
            cred.record.request_count += 1;
            cred.state.consecutive_errors = 0;
            cred.state.health_score = (cred.state.health_score + 10).min(100);
            cred.state.recent_requests.push_back(Instant::now());
            let ms = latency.as_millis() as f64;
            cred.state.avg_latency_ms = if cred.state.avg_latency_ms == 0.0 {
                ms
            } else {
                cred.state.avg_latency_ms * 0.7 + ms * 0.3
            };
        }
    }

    pub fn record_error(&self, id: &str, kind: CredentialErrorKind) {
        let mut inner = self.inner.lock().unwrap();
        let Some(cred) = inner.creds.get_mut(id) else {
            return;
        };

        if kind != CredentialErrorKind::Network {
            cred.record.error_count += 1;
        }
        cred.state.consecutive_errors += 1;

        let decay = match kind {
            CredentialErrorKind::Banned => 50,
            CredentialErrorKind::Auth => 40,
            CredentialErrorKind::Quota => 30,
            _ => 20,
        };
        cred.state.health_score = (cred.state.health_score - decay).max(0);

        match kind {
            CredentialErrorKind::Banned => {
                cred.record.disabled = true;
                tracing::error!(credential = id, "credential banned, disabled permanently");
            }
            CredentialErrorKind::Quota => {
                cred.record.quota_exhausted = true;
                tracing::warn!(credential = id, "credential quota exhausted");
            }
            CredentialErrorKind::Auth => {
                cred.state.needs_refresh = true;
            }
            _ => {}
        }

        if cred.state.consecutive_errors >= self.error_threshold {
            cred.state.cooldown_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                credential = id,
                consecutive = cred.state.consecutive_errors,
                "credential entering cooldown"
            );
        }
    }

    pub fn needs_refresh(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .creds
            .get(id)
            .is_some_and(|c| c.state.needs_refresh)
    }

    pub fn mark_needs_refresh(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.creds.get_mut(id) {
            cred.state.needs_refresh = true;
        }
    }

    /// Cool a credential for a fixed window (non-permanent refresh failure).
    pub fn cooldown_for(&self, id: &str, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cred) = inner.creds.get_mut(id) {
            cred.state.cooldown_until = Some(Instant::now() + duration);
        }
    }

    // ── Maintenance ─────────────────────────────────────────────

    /// Periodic self-heal: if every credential is unavailable, give the
    /// error-ridden ones a second chance; if that still leaves nothing,
    /// wipe cooldowns and error counts entirely.
    pub fn self_heal(&self) {
        let mut inner = self.inner.lock().unwrap();

        let any_available = inner.creds.values_mut().any(|c| {
            !c.record.disabled
                && !c.record.quota_exhausted
                && !c.state.in_cooldown()
                && c.state.consecutive_errors < self.error_threshold
        });
        if any_available || inner.creds.is_empty() {
            return;
        }

        tracing::warn!("self-heal: no available credentials, relaxing error state");
        for cred in inner.creds.values_mut() {
            if cred.record.disabled {
                continue;
            }
            if cred.state.consecutive_errors > 0 || cred.record.error_count > 0 {
                cred.record.error_count /= 2;
                cred.state.consecutive_errors = 0;
                cred.state.health_score = cred.state.health_score.max(50);
            }
        }

        let healed = inner.creds.values_mut().any(|c| {
            !c.record.disabled && !c.record.quota_exhausted && !c.state.in_cooldown()
        });
        if !healed {
            tracing::warn!("self-heal: full reset of cooldowns and error counts");
            for cred in inner.creds.values_mut() {
                cred.state.cooldown_until = None;
                cred.state.consecutive_errors = 0;
                cred.record.error_count = 0;
            }
        }
    }

    /// Ids that need a token refresh (flagged, or expiring within 5 min).
    pub fn refresh_queue(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .creds
            .values()
            .filter(|c| {
                !c.record.disabled
                    && c.record.refresh_token.is_some()
                    && (c.state.needs_refresh
                        || c.record.expires_in_secs().is_some_and(|s| s < 300))
            })
            .map(|c| c.record.id.clone())
            .collect()
    }

    pub fn diagnostics(&self) -> serde_json::Value {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.order.clone();
        let mut entries = Vec::new();
        for id in &order {
            if let Some(cred) = inner.creds.get_mut(id) {
                let recent = cred.state.recent_request_count();
                entries.push(json!({
                    "id": cred.record.id,
                    "region": cred.record.region,
                    "subscription_tier": cred.record.subscription_tier,
                    "disabled": cred.record.disabled,
                    "quota_exhausted": cred.record.quota_exhausted,
                    "requests": cred.record.request_count,
                    "errors": cred.record.error_count,
                    "consecutive_errors": cred.state.consecutive_errors,
                    "health_score": cred.state.health_score,
                    "inflight": cred.state.inflight,
                    "recent_5m": recent,
                    "in_cooldown": cred.state.in_cooldown(),
                    "avg_latency_ms": cred.state.avg_latency_ms as u64,
                    "token_expires_in_secs": cred.record.expires_in_secs(),
                }));
            }
        }
        json!({
            "policy": *self.policy.lock().unwrap(),
            "credentials": entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(ids: &[&str]) -> Arc<CredentialPool> {
        let pool = Arc::new(CredentialPool::new());
        for id in ids {
            let mut rec = CredentialRecord::new(*id);
            rec.access_token = format!("tok-{}", id);
            rec.subscription_tier = Some("pro".into());
            pool.add(rec);
        }
        pool
    }

    #[test]
    fn lease_releases_on_drop() {
        let pool = pool_with(&["a"]);
        {
            let lease = pool.acquire(None).unwrap();
            assert_eq!(lease.id(), "a");
            let diag = pool.diagnostics();
            assert_eq!(diag["credentials"][0]["inflight"], 1);
        }
        let diag = pool.diagnostics();
        assert_eq!(diag["credentials"][0]["inflight"], 0);
    }

    #[test]
    fn single_credential_clears_cooldown() {
        let pool = pool_with(&["only"]);
        for _ in 0..5 {
            pool.record_error("only", CredentialErrorKind::Other);
        }
        let lease = pool.acquire(None);
        assert!(lease.is_some(), "single credential must stay schedulable");
    }

    #[test]
    fn cooldown_after_consecutive_errors() {
        let pool = pool_with(&["a", "b"]);
        for _ in 0..5 {
            pool.record_error("a", CredentialErrorKind::Other);
        }
        // "a" is cooling; every acquire must land on "b".
        for _ in 0..10 {
            let lease = pool.acquire(None).unwrap();
            assert_eq!(lease.id(), "b");
        }
        // Persistent count is unchanged by the cooldown itself.
        assert_eq!(pool.record("a").unwrap().error_count, 5);
    }

    #[test]
    fn banned_credential_is_dropped_permanently() {
        let pool = pool_with(&["a", "b"]);
        pool.record_error("a", CredentialErrorKind::Banned);
        assert!(pool.record("a").unwrap().disabled);
        for _ in 0..10 {
            assert_eq!(pool.acquire(None).unwrap().id(), "b");
        }
    }

    #[test]
    fn quota_exhaustion_and_recovery() {
        let pool = pool_with(&["a", "b"]);
        pool.record_error("a", CredentialErrorKind::Quota);
        assert!(pool.record("a").unwrap().quota_exhausted);
        assert_eq!(pool.acquire(None).unwrap().id(), "b");

        pool.clear_quota_exhausted("a");
        assert!(!pool.record("a").unwrap().quota_exhausted);
    }

    #[test]
    fn network_errors_skip_persistent_count() {
        let pool = pool_with(&["a", "b"]);
        pool.record_error("a", CredentialErrorKind::Network);
        let rec = pool.record("a").unwrap();
        assert_eq!(rec.error_count, 0);
    }

    #[test]
    fn free_tier_cannot_serve_opus() {
        let pool = pool_with(&["paid"]);
        let mut free = CredentialRecord::new("free");
        free.subscription_tier = Some("KIRO FREE".into());
        pool.add(free);

        for _ in 0..10 {
            let lease = pool.acquire(Some("claude-opus-4-5")).unwrap();
            assert_eq!(lease.id(), "paid");
        }
    }

    #[test]
    fn empty_pool_returns_none() {
        let pool = Arc::new(CredentialPool::new());
        assert!(pool.acquire(None).is_none());
    }

    #[test]
    fn self_heal_restores_exhausted_pool() {
        let pool = pool_with(&["a", "b"]);
        for id in ["a", "b"] {
            for _ in 0..5 {
                pool.record_error(id, CredentialErrorKind::Other);
            }
        }
        pool.self_heal();
        assert!(pool.acquire(None).is_some());
    }

    #[test]
    fn health_score_clamps() {
        let pool = pool_with(&["a", "b"]);
        for _ in 0..10 {
            pool.record_error("a", CredentialErrorKind::Other);
        }
        let diag = pool.diagnostics();
        let health = diag["credentials"][0]["health_score"].as_i64().unwrap();
        assert_eq!(health, 0);
        for _ in 0..20 {
            pool.record_success("a", 10, Duration::from_millis(100));
        }
        let diag = pool.diagnostics();
        assert_eq!(diag["credentials"][0]["health_score"], 100);
    }
}
