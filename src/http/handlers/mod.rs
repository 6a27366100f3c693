//! HTTP handlers for the admin API and the mock catch-all.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::http::types::ErrorBody;
use crate::registry::RegistryError;

pub mod dispatch;
pub mod mocks;
pub mod status;

pub use dispatch::dispatch;
pub use mocks::{create_mocks, delete_all_mocks, delete_mock, get_mock, list_mocks, update_mock};
pub use status::{healthz, status};

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let code = match &self {
            RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Storage(_) | RegistryError::IdSpaceExhausted => {
                error!(error = %self, "admin request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}
