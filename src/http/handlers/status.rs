//! Health and status handlers.

use axum::{extract::State, Json};

use crate::http::state::AppState;
use crate::registry::RegistryStatus;

/// Storage mode, backend connectivity and mock count.
pub async fn status(State(state): State<AppState>) -> Json<RegistryStatus> {
    Json(state.registry.status().await)
}

/// Liveness check.
pub async fn healthz() -> &'static str {
    "ok"
}
