//! Public status endpoints and admin stats/config/settings.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::compress::CompressorConfig;
use crate::errors::AppError;
use crate::pool::policy::SchedulingPolicy;
use crate::store::{KeyValueStore, NS_CONFIG};
use crate::AppState;

pub async fn public_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "credentials": state.pool.len(),
        "circuit": state.breaker.state(),
    }))
}

pub async fn public_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "healthy": !state.pool.is_empty(),
        "circuit": state.breaker.state(),
    }))
}

pub async fn public_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "pool": state.pool.diagnostics(),
        "compressor": {
            "compressions": state
                .compressor
                .stats
                .compressions
                .load(std::sync::atomic::Ordering::Relaxed),
            "cache_hits": state
                .compressor
                .stats
                .cache_hits
                .load(std::sync::atomic::Ordering::Relaxed),
            "failures": state
                .compressor
                .stats
                .failures
                .load(std::sync::atomic::Ordering::Relaxed),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let entries = state.metrics.recent_logs(query.limit.min(500));
    Json(json!({ "logs": entries }))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let stored = state
        .store
        .get(NS_CONFIG, "proxy")
        .await
        .map_err(AppError::Internal)?
        .unwrap_or_else(|| json!({}));
    Ok(Json(stored))
}

pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    state
        .store
        .put(NS_CONFIG, "proxy", &body)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "saved": true })))
}

#[derive(Debug, Deserialize)]
pub struct SettingsPayload {
    pub scheduling_policy: Option<SchedulingPolicy>,
    pub compression_enabled: Option<bool>,
    pub auto_compress: Option<bool>,
    pub compression_keep_count: Option<usize>,
    pub compression_token_threshold: Option<u64>,
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let compressor = state.compressor.config();
    Json(json!({
        "scheduling_policy": state.pool.policy(),
        "compression_enabled": compressor.enabled,
        "auto_compress": compressor.auto_compress,
        "compression_keep_count": compressor.keep_count,
        "compression_token_threshold": compressor.token_threshold,
        "rate_limit_per_minute": state.config.rate_limit_per_minute,
    }))
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SettingsPayload>,
) -> Result<Json<Value>, AppError> {
    if let Some(policy) = payload.scheduling_policy {
        state.pool.set_policy(policy);
    }

    let mut compressor: CompressorConfig = state.compressor.config();
    if let Some(v) = payload.compression_enabled {
        compressor.enabled = v;
    }
    if let Some(v) = payload.auto_compress {
        compressor.auto_compress = v;
    }
    if let Some(v) = payload.compression_keep_count {
        compressor.keep_count = v;
    }
    if let Some(v) = payload.compression_token_threshold {
        compressor.token_threshold = v;
    }
    state.compressor.set_config(compressor);

    let snapshot = json!({
        "scheduling_policy": state.pool.policy(),
        "compressor": {
            "enabled": state.compressor.config().enabled,
            "auto_compress": state.compressor.config().auto_compress,
            "keep_count": state.compressor.config().keep_count,
            "token_threshold": state.compressor.config().token_threshold,
        },
    });
    state
        .store
        .put(NS_CONFIG, "settings", &snapshot)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(snapshot))
}
