//! The `/v1/*` inference surface.

pub mod chat;
pub mod dispatch;
pub mod messages;
pub mod models_api;
pub mod summarizer;

use std::sync::Arc;

use serde_json::Value;

use crate::AppState;

/// Run auto-compression over a raw `messages` array in place, keyed by
/// the same session identifier the translator will use.
pub async fn maybe_compress(state: &Arc<AppState>, body: &mut Value, session: Option<&str>) {
    if !state.config.enable_compression {
        return;
    }
    let Some(messages) = body.get("messages").and_then(Value::as_array).cloned() else {
        return;
    };
    if !state.compressor.should_compress(&messages) {
        return;
    }
    let conversation_id = state.conv_ids.resolve(session);
    let compressed = state
        .compressor
        .compress(&conversation_id, messages, 0)
        .await;
    tracing::info!(
        conversation = %conversation_id,
        compressed_len = compressed.len(),
        "conversation history compressed"
    );
    body["messages"] = Value::Array(compressed);
}
