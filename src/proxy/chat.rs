//! `/v1/chat/completions`: OpenAI dialect.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde_json::Value;

use crate::convert;
use crate::errors::AppError;
use crate::middleware::auth;
use crate::models::openai::ChatCompletionRequest;
use crate::proxy::dispatch::{self, Dialect, RequestContext};
use crate::AppState;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
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
        .get("user")
        .and_then(Value::as_str)
        .map(str::to_string);
    super::maybe_compress(&state, &mut body, session.as_deref()).await;

    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| AppError::InvalidRequest(format!("malformed request body: {}", e)))?;
    if request.messages.is_empty() {
        return Err(AppError::InvalidRequest("messages must not be empty".into()));
    }

    let prepared = convert::prepare_openai(&request, &state.conv_ids, &state.tools)?;

    dispatch::execute(
        state,
        prepared,
        RequestContext {
            auth: auth_mode,
            dialect: Dialect::OpenAi,
            stream: request.stream,
        },
    )
    .await
}
