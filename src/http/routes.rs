//! HTTP routing: admin endpoints under `/mocks`, everything else is dispatched to mocks.

use axum::{
    routing::{get, post},
    Router,
};

use crate::http::handlers::*;
use crate::http::state::AppState;

/// Build the Axum router with all API endpoints.
///
/// Requests no admin route claims fall through to the mock dispatcher, whatever their
/// method or path.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        // Admin API
        .route("/mocks/configurar/endpoint", post(create_mocks))
        .route("/mocks", get(list_mocks).delete(delete_all_mocks))
        .route("/mocks/{id}", get(get_mock).put(update_mock).delete(delete_mock))
        // Registered mocks
        .fallback(dispatch)
        .with_state(state)
}
