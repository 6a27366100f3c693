//! Catch-all handler serving registered mocks.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::dispatch::{DispatchOutcome, DispatchRequest, DispatchResponse};
use crate::http::state::AppState;
use crate::http::types::MissBody;

/// Answer any request not claimed by the admin routes.
///
/// # Returns
///
/// Returns the first matching mock's status, headers and substituted body, or 404 if
/// no mock matches.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let path = urlencoding::decode(uri.path())
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| uri.path().to_owned());
    let request = DispatchRequest {
        method: method.as_str().to_owned(),
        path,
        query,
        body: (!body.is_empty()).then_some(body),
    };

    match state.dispatcher.dispatch(&request).await {
        DispatchOutcome::Matched(matched) => render(matched),
        DispatchOutcome::Miss => (
            StatusCode::NOT_FOUND,
            Json(MissBody {
                error: format!("no mock configured for {} {}", request.method, request.path),
            }),
        )
            .into_response(),
    }
}

fn render(matched: DispatchResponse) -> Response {
    let code = StatusCode::from_u16(matched.status_code).unwrap_or_else(|_| {
        warn!(id = %matched.mock_id, status = matched.status_code, "unusable status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    let mut response = (code, Json(matched.body)).into_response();

    for (name, value) in matched.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(id = %matched.mock_id, header = %name, "skipping invalid response header"),
        }
    }
    response
}
