//! Credential records and their runtime scheduling state.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable part of a credential, persisted to the KV store under
/// `credentials/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
    /// 64-hex machine fingerprint; derived from the refresh token when absent.
    #[serde(default)]
    pub machine_id: Option<String>,
    /// Subscription tier as reported by the upstream; unknown means free.
    #[serde(default)]
    pub subscription_tier: Option<String>,
    /// Access-token expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub quota_exhausted: bool,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            access_token: String::new(),
            refresh_token: None,
            region: None,
            profile_arn: None,
            machine_id: None,
            subscription_tier: None,
            expires_at: None,
            disabled: false,
            quota_exhausted: false,
            request_count: 0,
            error_count: 0,
            created_at: Some(Utc::now()),
        }
    }

    /// Free-tier credentials cannot serve Opus-class models. An absent
    /// tier is treated as free.
    pub fn is_free_tier(&self) -> bool {
        match self.subscription_tier.as_deref() {
            Some(tier) => tier.to_lowercase().contains("free"),
            None => true,
        }
    }

    /// Seconds until the access token expires; negative when already past.
    pub fn expires_in_secs(&self) -> Option<i64> {
        self.expires_at
            .map(|t| t.signed_duration_since(Utc::now()).num_seconds())
    }
}

/// In-memory scheduling state; never persisted.
#[derive(Debug)]
pub struct CredentialState {
    pub inflight: u32,
    pub consecutive_errors: u32,
    pub health_score: i32,
    pub cooldown_until: Option<Instant>,
    pub last_used: Option<Instant>,
    /// Completion timestamps inside the sliding 5-minute window.
    pub recent_requests: VecDeque<Instant>,
    /// EWMA of request latency in milliseconds.
    pub avg_latency_ms: f64,
    pub needs_refresh: bool,
}

impl Default for CredentialState {
    fn default() -> Self {
        Self {
            inflight: 0,
            consecutive_errors: 0,
            health_score: 100,
            cooldown_until: None,
            last_used: None,
            recent_requests: VecDeque::new(),
            avg_latency_ms: 0.0,
            needs_refresh: false,
        }
    }
}

impl CredentialState {
    pub fn in_cooldown(&self) -> bool {
        self.cooldown_until.is_some_and(|t| t > Instant::now())
    }

    /// Requests completed in the last five minutes; prunes as it counts.
    pub fn recent_request_count(&mut self) -> usize {
        let window = std::time::Duration::from_secs(300);
        while self
            .recent_requests
            .front()
            .is_some_and(|t| t.elapsed() > window)
        {
            self.recent_requests.pop_front();
        }
        self.recent_requests.len()
    }
}

/// Error kinds the pool's bookkeeping distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialErrorKind {
    Network,
    Quota,
    Auth,
    Banned,
    Other,
}
