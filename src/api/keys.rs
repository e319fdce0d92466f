//! API-key CRUD. The raw key appears exactly once, in the create
//! response; every other read is masked.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::models::apikey::ApiKeyRecord;
use crate::store::{KeyValueStore, NS_APIKEYS};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct KeyPayload {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub allowed_models: Option<Vec<String>>,
    pub allowed_credentials: Option<Vec<String>>,
}

fn masked(record: &ApiKeyRecord) -> Value {
    json!({
        "id": record.id,
        "key": record.masked_key(),
        "name": record.name,
        "enabled": record.enabled,
        "allowed_models": record.allowed_models,
        "allowed_credentials": record.allowed_credentials,
        "request_count": record.request_count,
        "created_at": record.created_at,
        "last_used": record.last_used,
    })
}

async fn persist(state: &Arc<AppState>, record: &ApiKeyRecord) -> Result<(), AppError> {
    let value = serde_json::to_value(record).map_err(|e| AppError::Internal(e.into()))?;
    state
        .store
        .put(NS_APIKEYS, &record.id, &value)
        .await
        .map_err(AppError::Internal)
}

pub async fn list(State(state): State<Arc<AppState>>) -> Json<Value> {
    let keys: Vec<Value> = state.api_keys.list().iter().map(masked).collect();
    Json(json!({ "keys": keys }))
}

pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .api_keys
        .get_by_id(&id)
        .map(|r| Json(masked(&r)))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<KeyPayload>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let mut record = ApiKeyRecord::generate(payload.name.as_deref().unwrap_or("unnamed"));
    if let Some(models) = payload.allowed_models {
        record.allowed_models = models;
    }
    if let Some(creds) = payload.allowed_credentials {
        record.allowed_credentials = creds;
    }

    state.api_keys.insert(record.clone());
    persist(&state, &record).await?;
    tracing::info!(key_id = %record.id, "API key created");

    // The one and only disclosure of the raw key.
    let mut body = masked(&record);
    body["key"] = Value::String(record.key.clone());
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<KeyPayload>,
) -> Result<Json<Value>, AppError> {
    let found = state.api_keys.update(&id, |record| {
        if let Some(name) = payload.name {
            record.name = name;
        }
        if let Some(enabled) = payload.enabled {
            record.enabled = enabled;
        }
        if let Some(models) = payload.allowed_models {
            record.allowed_models = models;
        }
        if let Some(creds) = payload.allowed_credentials {
            record.allowed_credentials = creds;
        }
    });
    if !found {
        return Err(AppError::InvalidRequest(format!("no such key: {}", id)));
    }

    let record = state.api_keys.get_by_id(&id).expect("just updated");
    persist(&state, &record).await?;
    Ok(Json(masked(&record)))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.api_keys.remove_by_id(&id) {
        return Ok(StatusCode::NOT_FOUND);
    }
    state
        .store
        .delete(NS_APIKEYS, &id)
        .await
        .map_err(AppError::Internal)?;
    Ok(StatusCode::NO_CONTENT)
}
