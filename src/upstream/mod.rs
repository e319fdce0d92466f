//! Upstream client: endpoint failover, retry ladder, degraded-payload
//! recovery.

pub mod decoder;
pub mod endpoints;
pub mod events;

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::auth;
use crate::convert::{DegradeTier, PreparedConversation};
use crate::models::credential::CredentialRecord;
use endpoints::{DnsCache, Endpoint, EndpointHealth};

/// Hard cap on one upstream POST, headers to end of stream.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_TOTAL_ATTEMPTS: u32 = 3;
const MAX_ATTEMPTS_PER_ENDPOINT: u32 = 2;
const MAX_TRUNCATION_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("quota exhausted")]
    Quota,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited on every endpoint")]
    RateLimited,
    #[error("request rejected: {0}")]
    BadRequest(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("retries exhausted: {0}")]
    Exhausted(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Quota => Some(402),
            UpstreamError::Auth(_) => Some(403),
            UpstreamError::RateLimited => Some(429),
            UpstreamError::BadRequest(_) => Some(400),
            _ => None,
        }
    }
}

/// A live upstream stream plus where it landed, so the caller can feed
/// endpoint health after the body finishes.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub response: reqwest::Response,
    pub endpoint_id: &'static str,
    pub started: Instant,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    pub health: EndpointHealth,
    pub dns: DnsCache,
    default_region: String,
    /// Test hook: route every endpoint at one base URL and skip DNS.
    base_url_override: Option<String>,
}

impl UpstreamClient {
    pub fn new(default_region: &str) -> Self {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(16)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            health: EndpointHealth::new(),
            dns: DnsCache::new(),
            default_region: default_region.to_string(),
            base_url_override: None,
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url_override = Some(base.trim_end_matches('/').to_string());
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    /// POST the conversation, walking endpoints and degradation tiers
    /// until a stream opens or the retry budget runs dry.
    pub async fn send_conversation(
        &self,
        record: &CredentialRecord,
        prepared: &PreparedConversation,
        preferred_endpoint: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let region = record.region.as_deref().unwrap_or(&self.default_region);
        let task_type = auth::agent_mode(record);
        let fingerprint = auth::machine_fingerprint(record);

        let mut tier = DegradeTier::Full;
        let mut truncation_retries = 0u32;
        let mut aggressive_used = false;
        let mut total_attempts = 0u32;
        let mut backoff_exp = 0u32;
        let mut last_error = UpstreamError::Exhausted("no endpoints tried".into());

        let ordered = self.health.ordered(preferred_endpoint);
        let mut endpoint_cursor = 0usize;
        let mut attempts_on_endpoint = 0u32;

        while total_attempts < MAX_TOTAL_ATTEMPTS + truncation_retries {
            let endpoint = ordered[endpoint_cursor % ordered.len()];
            if attempts_on_endpoint >= MAX_ATTEMPTS_PER_ENDPOINT {
                endpoint_cursor += 1;
                attempts_on_endpoint = 0;
                continue;
            }
            attempts_on_endpoint += 1;
            total_attempts += 1;

            if self.base_url_override.is_none() {
                let host = endpoint.host(region);
                let bare = host.trim_start_matches("https://");
                if let Err(e) = self.dns.resolve(bare).await {
                    tracing::warn!(endpoint = endpoint.id, "dns resolution failed: {}", e);
                    self.health.record_failure(endpoint.id);
                    last_error = UpstreamError::Network(e);
                    endpoint_cursor += 1;
                    attempts_on_endpoint = 0;
                    continue;
                }
            }

            let url = self.endpoint_url(endpoint, region);
            let payload = prepared.to_payload(
                endpoint.origin,
                task_type,
                record.profile_arn.as_deref(),
                tier,
            );
            let started = Instant::now();

            let outcome = self
                .http
                .post(&url)
                .headers(request_headers(record, fingerprint.as_deref(), task_type))
                .timeout(UPSTREAM_TIMEOUT)
                .json(&payload)
                .send()
                .await;

            let response = match outcome {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(endpoint = endpoint.id, "upstream POST failed: {}", e);
                    self.health.record_failure(endpoint.id);
                    last_error = UpstreamError::Network(e.to_string());
                    endpoint_cursor += 1;
                    attempts_on_endpoint = 0;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                self.health
                    .record_success(endpoint.id, started.elapsed());
                return Ok(UpstreamResponse {
                    response,
                    endpoint_id: endpoint.id,
                    started,
                });
            }

            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                endpoint = endpoint.id,
                status = status.as_u16(),
                tier = ?tier,
                "upstream rejected request: {}",
                truncate_for_log(&body)
            );

            match status.as_u16() {
                429 => {
                    self.health.record_failure(endpoint.id);
                    last_error = UpstreamError::RateLimited;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    endpoint_cursor += 1;
                    attempts_on_endpoint = 0;
                }
                402 => return Err(UpstreamError::Quota),
                401 | 403 => return Err(UpstreamError::Auth(body)),
                400 if is_content_length_error(&body) => {
                    if truncation_retries >= MAX_TRUNCATION_RETRIES {
                        return Err(UpstreamError::BadRequest(body));
                    }
                    truncation_retries += 1;
                    tier = match tier {
                        DegradeTier::Full | DegradeTier::Aggressive => DegradeTier::HalfHistory,
                        DegradeTier::HalfHistory => DegradeTier::QuarterHistory,
                        _ => DegradeTier::NoHistory,
                    };
                    // Same endpoint gets the smaller payload immediately.
                    attempts_on_endpoint -= 1;
                }
                400 => {
                    if aggressive_used {
                        return Err(UpstreamError::BadRequest(body));
                    }
                    aggressive_used = true;
                    tier = DegradeTier::Aggressive;
                    attempts_on_endpoint -= 1;
                    // One extra shot for the sanitized payload.
                    truncation_retries += 1;
                }
                s if s >= 500 => {
                    self.health.record_failure(endpoint.id);
                    last_error = UpstreamError::Exhausted(format!("upstream {}: {}", s, body));
                    let delay = Duration::from_millis(
                        (500u64 << backoff_exp.min(2)).min(2_000),
                    );
                    backoff_exp += 1;
                    tokio::time::sleep(delay).await;
                }
                s => {
                    self.health.record_failure(endpoint.id);
                    return Err(UpstreamError::Exhausted(format!(
                        "unexpected upstream status {}: {}",
                        s, body
                    )));
                }
            }
        }

        Err(last_error)
    }

    /// GET the usage-limits endpoint for a credential (admin probe; a
    /// success also signals quota recovery).
    pub async fn usage_limits(
        &self,
        record: &CredentialRecord,
    ) -> Result<serde_json::Value, UpstreamError> {
        let region = record.region.as_deref().unwrap_or(&self.default_region);
        let base = match &self.base_url_override {
            Some(b) => b.clone(),
            None => endpoints::ENDPOINTS[0].host(region),
        };
        let response = self
            .http
            .get(format!("{}/getUsageLimits", base))
            .bearer_auth(&record.access_token)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200 => response
                .json()
                .await
                .map_err(|e| UpstreamError::Network(e.to_string())),
            401 | 403 => Err(UpstreamError::Auth("usage probe unauthorized".into())),
            402 => Err(UpstreamError::Quota),
            s => Err(UpstreamError::Exhausted(format!("usage probe status {}", s))),
        }
    }

    fn endpoint_url(&self, endpoint: &Endpoint, region: &str) -> String {
        let url = endpoint.url(region);
        match &self.base_url_override {
            Some(base) => {
                let path = url.rsplit_once(".com").map(|(_, p)| p).unwrap_or("/");
                format!("{}{}", base, path)
            }
            None => url,
        }
    }
}

fn request_headers(
    record: &CredentialRecord,
    fingerprint: Option<&str>,
    task_type: &str,
) -> reqwest::header::HeaderMap {
    use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};

    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", record.access_token)) {
        headers.insert(AUTHORIZATION, v);
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let fp_tag = fingerprint.map(|f| &f[..32.min(f.len())]).unwrap_or("anonymous");
    if let Ok(v) = HeaderValue::from_str(&format!(
        "aws-sdk-js/1.0.27 ua/2.1 os/other lang/js api/codewhispererstreaming#1.0.27 m/E KiroGate-{}",
        fp_tag
    )) {
        headers.insert(USER_AGENT, v);
    }
    if let Ok(v) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        headers.insert("amz-sdk-invocation-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(task_type) {
        headers.insert("x-amzn-kiro-agent-mode", v);
    }
    headers
}

fn is_content_length_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("content length exceeds")
        || lower.contains("input is too long")
        || lower.contains("improperly formed request")
        || lower.contains("contentlengthexceeded")
}

fn truncate_for_log(body: &str) -> String {
    body.chars().take(200).collect()
}
