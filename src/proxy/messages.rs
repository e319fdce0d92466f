//! `/v1/messages`: Anthropic dialect, including `count_tokens`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::convert;
use crate::errors::AppError;
use crate::middleware::auth;
use crate::models::anthropic::MessagesRequest;
use crate::proxy::dispatch::{self, Dialect, RequestContext};
use crate::tokenizer;
use crate::AppState;

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    match messages_inner(state, headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_anthropic_response(),
    }
}

async fn messages_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    mut body: Value,
) -> Result<Response, AppError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::InvalidRequest("missing field: model".into()))?
        .to_string();

    let auth_mode = auth::resolve(
        &headers,
        &model,
        &state.config.proxy_api_key,
        &state.api_keys,
        &state.pool,
    )?;

    let session = body
        .pointer("/metadata/user_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    super::maybe_compress(&state, &mut body, session.as_deref()).await;

    let request: MessagesRequest = serde_json::from_value(body)
        .map_err(|e| AppError::InvalidRequest(format!("malformed request body: {}", e)))?;
    if request.messages.is_empty() {
        return Err(AppError::InvalidRequest("messages must not be empty".into()));
    }

    let prepared = convert::prepare_anthropic(&request, &state.conv_ids, &state.tools)?;

    dispatch::execute(
        state,
        prepared,
        RequestContext {
            auth: auth_mode,
            dialect: Dialect::Anthropic,
            stream: request.stream,
        },
    )
    .await
}

/// `/v1/messages/count_tokens`: local estimate, no upstream call.
pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let result = count_tokens_inner(state, headers, body);
    match result {
        Ok(count) => Json(json!({ "input_tokens": count })).into_response(),
        Err(e) => e.into_anthropic_response(),
    }
}

fn count_tokens_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Value,
) -> Result<u64, AppError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("claude-sonnet-4-5")
        .to_string();
    auth::resolve(
        &headers,
        &model,
        &state.config.proxy_api_key,
        &state.api_keys,
        &state.pool,
    )?;

    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::InvalidRequest("missing field: messages".into()))?;

    let mut total = tokenizer::estimate_messages(messages);
    if let Some(system) = body.get("system") {
        total += tokenizer::estimate_tokens(&convert::text_of(system));
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for tool in tools {
            total += 4 + tokenizer::estimate_tokens(&tool.to_string()) / 2;
        }
    }
    Ok(total)
}
