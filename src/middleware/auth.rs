//! Authentication for the `/v1/*` surface.
//!
//! Three accepted shapes:
//! 1. the configured `PROXY_API_KEY`: requests draw from the shared pool;
//! 2. `PROXY_API_KEY:refreshToken`: a synthetic credential is
//!    materialized around the caller's own refresh token;
//! 3. a stored `kg-` API key, restricted to that key's allowed
//!    credentials/models, with per-key counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::HeaderMap;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::errors::AppError;
use crate::models::apikey::ApiKeyRecord;
use crate::models::credential::CredentialRecord;
use crate::pool::CredentialPool;

#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Any pool credential may serve the request.
    SharedPool,
    /// Pin to the synthetic credential for the caller's refresh token.
    Synthetic { credential_id: String },
    /// A stored API key with its restrictions.
    ApiKey {
        key_id: String,
        allowed_credentials: Vec<String>,
    },
}

/// Pull the bearer/x-api-key value off the request.
pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        })
        .filter(|v| !v.is_empty())
}

/// Resolve the caller's auth mode, materializing synthetic credentials
/// and bumping API-key counters as side effects.
pub fn resolve(
    headers: &HeaderMap,
    model: &str,
    proxy_api_key: &str,
    api_keys: &ApiKeyStore,
    pool: &Arc<CredentialPool>,
) -> Result<AuthMode, AppError> {
    let presented = extract_key(headers).ok_or(AppError::Unauthorized)?;

    if !proxy_api_key.is_empty() && presented == proxy_api_key {
        return Ok(AuthMode::SharedPool);
    }

    // `key:refreshToken` is bring-your-own-credential.
    if let Some((key, refresh_token)) = presented.split_once(':') {
        if !proxy_api_key.is_empty() && key == proxy_api_key && !refresh_token.is_empty() {
            let credential_id = synthetic_id(refresh_token);
            if pool.record(&credential_id).is_none() {
                let mut record = CredentialRecord::new(credential_id.clone());
                record.refresh_token = Some(refresh_token.to_string());
                pool.add(record);
                pool.mark_needs_refresh(&credential_id);
                tracing::info!(credential = %credential_id, "materialized synthetic credential");
            }
            return Ok(AuthMode::Synthetic { credential_id });
        }
    }

    if presented.starts_with("kg-") {
        if let Some(record) = api_keys.touch(&presented) {
            if !model.is_empty() && !record.allows_model(model) {
                return Err(AppError::InvalidRequest(format!(
                    "model {} is not allowed for this API key",
                    model
                )));
            }
            return Ok(AuthMode::ApiKey {
                key_id: record.id,
                allowed_credentials: record.allowed_credentials,
            });
        }
    }

    Err(AppError::Unauthorized)
}

fn synthetic_id(refresh_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(refresh_token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("byok-{}", &digest[..12])
}

// ── API key store ───────────────────────────────────────────────

/// In-memory view of `apikeys/*`, keyed by the raw key string.
#[derive(Default)]
pub struct ApiKeyStore {
    inner: Mutex<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, records: Vec<ApiKeyRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        for record in records {
            inner.insert(record.key.clone(), record);
        }
    }

    pub fn insert(&self, record: ApiKeyRecord) {
        self.inner
            .lock()
            .unwrap()
            .insert(record.key.clone(), record);
    }

    pub fn remove_by_id(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .values()
            .find(|r| r.id == id)
            .map(|r| r.key.clone());
        match key {
            Some(key) => inner.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<ApiKeyRecord> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn update<F: FnOnce(&mut ApiKeyRecord)>(&self, id: &str, f: F) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .values()
            .find(|r| r.id == id)
            .map(|r| r.key.clone());
        match key {
            Some(key) => {
                if let Some(record) = inner.get_mut(&key) {
                    f(record);
                }
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<ApiKeyRecord> {
        let mut records: Vec<ApiKeyRecord> =
            self.inner.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Look up an enabled key and bump its usage counters.
    pub fn touch(&self, raw_key: &str) -> Option<ApiKeyRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.get_mut(raw_key)?;
        if !record.enabled {
            return None;
        }
        record.request_count += 1;
        record.last_used = Some(Utc::now());
        Some(record.clone())
    }
}
