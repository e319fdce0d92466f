//! Periodic state snapshots to the KV store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time;

use crate::store::{KeyValueStore, NS_CREDENTIALS, NS_LOGS, NS_STATS};
use crate::AppState;

pub fn spawn(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        interval.tick().await; // skip the immediate tick
        loop {
            interval.tick().await;
            if let Err(e) = persist_all(&state).await {
                tracing::error!("snapshot job failed: {:#}", e);
            }
        }
    });
}

/// Write credentials, counters and the request-log tail. Also called once
/// more during shutdown.
pub async fn persist_all(state: &Arc<AppState>) -> anyhow::Result<()> {
    for record in state.pool.snapshot_records() {
        let value = serde_json::to_value(&record)?;
        state.store.put(NS_CREDENTIALS, &record.id, &value).await?;
    }

    state
        .store
        .put(NS_STATS, "proxy", &state.metrics.snapshot())
        .await?;

    let logs = serde_json::to_value(state.metrics.log_snapshot())?;
    state
        .store
        .put(NS_LOGS, "requests", &json!({ "entries": logs }))
        .await?;

    tracing::debug!("state snapshot persisted");
    Ok(())
}
