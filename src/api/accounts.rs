//! Credential CRUD and lifecycle actions.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth as credential_auth;
use crate::errors::AppError;
use crate::models::credential::CredentialRecord;
use crate::store::{KeyValueStore, NS_CREDENTIALS};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AccountPayload {
    pub id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub region: Option<String>,
    pub profile_arn: Option<String>,
    pub machine_id: Option<String>,
    pub subscription_tier: Option<String>,
    pub disabled: Option<bool>,
}

fn redacted(record: &CredentialRecord) -> Value {
    json!({
        "id": record.id,
        "region": record.region,
        "profile_arn": record.profile_arn,
        "subscription_tier": record.subscription_tier,
        "expires_at": record.expires_at,
        "disabled": record.disabled,
        "quota_exhausted": record.quota_exhausted,
        "request_count": record.request_count,
        "error_count": record.error_count,
        "created_at": record.created_at,
        "has_refresh_token": record.refresh_token.is_some(),
    })
}

async fn persist(state: &Arc<AppState>, record: &CredentialRecord) -> Result<(), AppError> {
    let value = serde_json::to_value(record).map_err(|e| AppError::Internal(e.into()))?;
    state
        .store
        .put(NS_CREDENTIALS, &record.id, &value)
        .await
        .map_err(AppError::Internal)
}

pub async fn list(State(state): State<Arc<AppState>>) -> Json<Value> {
    let records = state.pool.snapshot_records();
    Json(json!({ "accounts": records.iter().map(redacted).collect::<Vec<_>>() }))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .pool
        .record(&id)
        .map(|r| Json(redacted(&r)))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AccountPayload>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if payload.access_token.is_none() && payload.refresh_token.is_none() {
        return Err(AppError::InvalidRequest(
            "an access_token or refresh_token is required".into(),
        ));
    }

    let id = payload
        .id
        .unwrap_or_else(|| format!("acct-{}", uuid::Uuid::new_v4().simple()));
    let mut record = CredentialRecord::new(id);
    record.access_token = payload.access_token.unwrap_or_default();
    record.refresh_token = payload.refresh_token;
    record.region = payload.region;
    record.profile_arn = payload.profile_arn;
    record.machine_id = payload.machine_id;
    record.subscription_tier = payload.subscription_tier;

    state.pool.add(record.clone());
    persist(&state, &record).await?;
    tracing::info!(credential = %record.id, "credential added");
    Ok((StatusCode::CREATED, Json(redacted(&record))))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<AccountPayload>,
) -> Result<Json<Value>, AppError> {
    let found = state.pool.with_record_mut(&id, |record| {
        if let Some(v) = payload.access_token {
            record.access_token = v;
        }
        if let Some(v) = payload.refresh_token {
            record.refresh_token = Some(v);
        }
        if let Some(v) = payload.region {
            record.region = Some(v);
        }
        if let Some(v) = payload.profile_arn {
            record.profile_arn = Some(v);
        }
        if let Some(v) = payload.machine_id {
            record.machine_id = Some(v);
        }
        if let Some(v) = payload.subscription_tier {
            record.subscription_tier = Some(v);
        }
        if let Some(v) = payload.disabled {
            record.disabled = v;
        }
    });
    if !found {
        return Err(AppError::InvalidRequest(format!("no such account: {}", id)));
    }

    let record = state.pool.record(&id).expect("just updated");
    persist(&state, &record).await?;
    Ok(Json(redacted(&record)))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.pool.remove(&id) {
        return Ok(StatusCode::NOT_FOUND);
    }
    state
        .store
        .delete(NS_CREDENTIALS, &id)
        .await
        .map_err(AppError::Internal)?;
    tracing::info!(credential = %id, "credential deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Force a token refresh now.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = state
        .pool
        .record(&id)
        .ok_or_else(|| AppError::InvalidRequest(format!("no such account: {}", id)))?;

    let tokens = credential_auth::refresh_credential(
        state.upstream.http(),
        &record,
        state.upstream.default_region(),
        None,
    )
    .await
    .map_err(|e| AppError::Upstream(e.to_string()))?;

    state
        .pool
        .update_tokens(&id, tokens.access_token, tokens.expires_at);
    state.pool.with_record_mut(&id, |r| {
        if let Some(rt) = tokens.refresh_token.clone() {
            r.refresh_token = Some(rt);
        }
        if let Some(arn) = tokens.profile_arn.clone() {
            r.profile_arn = Some(arn);
        }
    });

    let updated = state.pool.record(&id).expect("just refreshed");
    persist(&state, &updated).await?;
    Ok(Json(json!({ "refreshed": true, "expires_at": updated.expires_at })))
}

/// Validate the credential end to end (refresh round-trip).
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = state
        .pool
        .record(&id)
        .ok_or_else(|| AppError::InvalidRequest(format!("no such account: {}", id)))?;

    let outcome = credential_auth::refresh_credential(
        state.upstream.http(),
        &record,
        state.upstream.default_region(),
        None,
    )
    .await;

    match outcome {
        Ok(tokens) => {
            state
                .pool
                .update_tokens(&id, tokens.access_token, tokens.expires_at);
            Ok(Json(json!({ "valid": true })))
        }
        Err(e) => Ok(Json(json!({ "valid": false, "error": e.to_string() }))),
    }
}

/// Probe the upstream usage-limits endpoint. A successful probe clears a
/// stale quota-exhausted flag.
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = state
        .pool
        .record(&id)
        .ok_or_else(|| AppError::InvalidRequest(format!("no such account: {}", id)))?;

    match state.upstream.usage_limits(&record).await {
        Ok(limits) => {
            state.pool.clear_quota_exhausted(&id);
            Ok(Json(limits))
        }
        Err(e) => Err(AppError::Upstream(e.to_string())),
    }
}
