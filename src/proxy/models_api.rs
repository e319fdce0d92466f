//! `/v1/models`: OpenAI-style model listing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::config;
use crate::errors::AppError;
use crate::middleware::auth;
use crate::AppState;

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    // Any valid key may list models; no model restriction applies here.
    auth::resolve(
        &headers,
        "",
        &state.config.proxy_api_key,
        &state.api_keys,
        &state.pool,
    )?;

    let created = state.started_at.timestamp();
    let data: Vec<Value> = config::AVAILABLE_MODELS
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "kiro-gateway",
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}
