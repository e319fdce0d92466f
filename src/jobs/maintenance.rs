//! Five-minute maintenance sweep: pool self-heal, cache pruning, token
//! refresh for credentials nearing expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::auth;
use crate::AppState;

pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(300));
        interval.tick().await;
        loop {
            interval.tick().await;
            run_once(&state).await;
        }
    });
}

async fn run_once(state: &Arc<AppState>) {
    state.pool.self_heal();
    state.limiter.cleanup();
    state.compressor.maintain().await;
    refresh_expiring(state).await;
}

/// Refresh flagged or soon-to-expire credentials ahead of traffic.
async fn refresh_expiring(state: &Arc<AppState>) {
    for id in state.pool.refresh_queue() {
        let Some(record) = state.pool.record(&id) else {
            continue;
        };
        match auth::refresh_credential(
            state.upstream.http(),
            &record,
            state.upstream.default_region(),
            None,
        )
        .await
        {
            Ok(tokens) => {
                state
                    .pool
                    .update_tokens(&id, tokens.access_token, tokens.expires_at);
                if let Some(rt) = tokens.refresh_token {
                    state.pool.with_record_mut(&id, |r| r.refresh_token = Some(rt));
                }
                tracing::info!(credential = %id, "background token refresh succeeded");
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!(credential = %id, "background refresh rejected: {}", e);
                state
                    .pool
                    .record_error(&id, crate::models::credential::CredentialErrorKind::Auth);
            }
            Err(e) => {
                tracing::warn!(credential = %id, "background refresh failed: {}", e);
                state.pool.cooldown_for(&id, Duration::from_secs(30));
            }
        }
    }
}
