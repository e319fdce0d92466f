//! Background tasks: periodic persistence and pool/cache maintenance.

pub mod maintenance;
pub mod snapshot;

use std::sync::Arc;

use crate::AppState;

/// Spawn all recurring tasks. Call once at startup.
pub fn spawn(state: Arc<AppState>) {
    snapshot::spawn(state.clone());
    maintenance::spawn(state);
}
