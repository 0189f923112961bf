//! Liveness probe. `AppState::new` already constructed the storage backend
//! client before the router starts serving, so there's nothing left to check
//! here beyond "the process is up".

use std::sync::Arc;

use axum::extract::State;

use crate::app::AppState;

pub async fn handle(State(_state): State<Arc<AppState>>) -> &'static str {
    "ok"
}
