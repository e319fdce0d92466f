//! Upstream credential refresh and machine identity.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::models::credential::CredentialRecord;

/// Agent-mode header value: `spec` when a machine fingerprint is known,
/// `vibe` otherwise.
pub fn agent_mode(record: &CredentialRecord) -> &'static str {
    if machine_fingerprint(record).is_some() {
        "spec"
    } else {
        "vibe"
    }
}

/// Normalize the credential's machine id into the 64-hex-lowercase form
/// the upstream expects:
/// * already 64 hex chars → lowercased as-is;
/// * a 32-hex UUID-ish id → doubled;
/// * otherwise derived as SHA-256 over `KotlinNativeAPI/<refresh token>`.
pub fn machine_fingerprint(record: &CredentialRecord) -> Option<String> {
    if let Some(raw) = record.machine_id.as_deref() {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() == 64 {
            return Some(cleaned);
        }
        if cleaned.len() == 32 {
            return Some(format!("{}{}", cleaned, cleaned));
        }
    }
    let refresh = record.refresh_token.as_deref()?;
    let mut hasher = Sha256::new();
    hasher.update(format!("KotlinNativeAPI/{}", refresh).as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Seconds until expiry.
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    profile_arn: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("credential has no refresh token")]
    NoRefreshToken,
    /// 4xx from the auth service: the refresh token itself is bad.
    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("refresh transport error: {0}")]
    Transport(String),
}

impl RefreshError {
    /// Rejections are permanent; transport problems are worth a retry on
    /// another credential after a short cooldown.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RefreshError::Rejected { .. } | RefreshError::NoRefreshToken)
    }
}

pub fn refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

/// Exchange the refresh token for a new access token.
pub async fn refresh_credential(
    client: &reqwest::Client,
    record: &CredentialRecord,
    default_region: &str,
    url_override: Option<&str>,
) -> Result<RefreshedTokens, RefreshError> {
    let refresh_token = record
        .refresh_token
        .as_deref()
        .ok_or(RefreshError::NoRefreshToken)?;
    let region = record.region.as_deref().unwrap_or(default_region);
    let url = url_override
        .map(str::to_string)
        .unwrap_or_else(|| refresh_url(region));

    let response = client
        .post(&url)
        .json(&serde_json::json!({ "refreshToken": refresh_token }))
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        return Err(RefreshError::Transport(format!("{}: {}", status, body)));
    }

    let parsed: RefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::Transport(format!("malformed refresh response: {}", e)))?;

    Ok(RefreshedTokens {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: parsed
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        profile_arn: parsed.profile_arn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(machine_id: Option<&str>, refresh: Option<&str>) -> CredentialRecord {
        let mut rec = CredentialRecord::new("c1");
        rec.machine_id = machine_id.map(str::to_string);
        rec.refresh_token = refresh.map(str::to_string);
        rec
    }

    #[test]
    fn full_hex_fingerprint_passes_through() {
        let hex = "ab".repeat(32);
        let rec = record_with(Some(&hex), None);
        assert_eq!(machine_fingerprint(&rec).unwrap(), hex);
    }

    #[test]
    fn uuid_fingerprint_doubles() {
        let rec = record_with(Some("0123456789abcdef0123456789ABCDEF"), None);
        let fp = machine_fingerprint(&rec).unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(&fp[..32], &fp[32..]);
    }

    #[test]
    fn fingerprint_derived_from_refresh_token() {
        let rec = record_with(None, Some("rt-123"));
        let fp = machine_fingerprint(&rec).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(machine_fingerprint(&rec), Some(fp));
    }

    #[test]
    fn agent_mode_follows_fingerprint_presence() {
        assert_eq!(agent_mode(&record_with(None, Some("rt"))), "spec");
        assert_eq!(agent_mode(&record_with(None, None)), "vibe");
    }

    #[tokio::test]
    async fn refresh_against_mock_server() {
        use wiremock::matchers::{body_partial_json, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"refreshToken": "rt-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "new-token",
                "expiresIn": 3600,
            })))
            .mount(&server)
            .await;

        let rec = record_with(None, Some("rt-1"));
        let tokens = refresh_credential(
            &reqwest::Client::new(),
            &rec,
            "us-east-1",
            Some(&server.uri()),
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token, "new-token");
        assert!(tokens.expires_at.is_some());
    }

    #[tokio::test]
    async fn refresh_rejection_is_permanent() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad token"))
            .mount(&server)
            .await;

        let rec = record_with(None, Some("rt-1"));
        let err = refresh_credential(
            &reqwest::Client::new(),
            &rec,
            "us-east-1",
            Some(&server.uri()),
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
    }
}
