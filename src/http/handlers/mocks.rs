//! Admin handlers: register, inspect, edit and remove mocks.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::warn;

use crate::definition::MockDefinition;
use crate::http::state::AppState;
use crate::http::types::{
    CreateAction, CreateFailure, CreateReport, CreatedMock, ErrorBody, MessageBody, MockList,
    MockPatch,
};
use crate::registry::RegistryError;

/// Register one definition or a list of them.
///
/// Each entry is upserted independently; rejected entries are reported by index and do
/// not stop the rest.
///
/// # Returns
///
/// Returns 200 with a `CreateReport`, or 400 if the body is neither an object nor an array.
pub async fn create_mocks(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let entries = match payload {
        Value::Array(entries) => entries,
        entry @ Value::Object(_) => vec![entry],
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("expected a mock definition or a list of them")),
            )
                .into_response();
        }
    };

    let mut report = CreateReport::default();
    for (index, entry) in entries.into_iter().enumerate() {
        let mock = match serde_json::from_value::<MockDefinition>(entry)
            .map_err(|err| RegistryError::Validation(err.to_string()))
            .and_then(MockDefinition::into_new_mock)
        {
            Ok(mock) => mock,
            Err(err) => {
                report.errors.push(CreateFailure { index, error: err.to_string() });
                continue;
            }
        };

        let (uri, http_method) = (mock.uri.clone(), mock.http_method.clone());
        match state.registry.create_or_update(mock).await {
            Ok(upserted) => report.created.push(CreatedMock {
                id: upserted.id,
                uri,
                http_method,
                action: if upserted.created { CreateAction::Created } else { CreateAction::Updated },
            }),
            Err(err) => {
                warn!(index, error = %err, "mock definition rejected");
                report.errors.push(CreateFailure { index, error: err.to_string() });
            }
        }
    }

    report.message = format!("{} mock(s) configured", report.created.len());
    (StatusCode::OK, Json(report)).into_response()
}

/// List id, uri, method and status of every mock.
pub async fn list_mocks(State(state): State<AppState>) -> Json<MockList> {
    Json(MockList { mocks: state.registry.list_summaries().await })
}

/// Full record of one mock.
pub async fn get_mock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, RegistryError> {
    let record = state.registry.get(&id).await.ok_or(RegistryError::NotFound(id))?;
    Ok(Json(record).into_response())
}

/// Partially update one mock.
pub async fn update_mock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<MockPatch>,
) -> Result<Json<MessageBody>, RegistryError> {
    state.registry.update(&id, patch.into()).await?;
    Ok(Json(MessageBody::new(format!("mock {id} updated"))))
}

/// Remove one mock.
pub async fn delete_mock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageBody>, RegistryError> {
    state.registry.delete(&id).await?;
    Ok(Json(MessageBody::new(format!("mock {id} removed"))))
}

/// Remove every mock.
pub async fn delete_all_mocks(
    State(state): State<AppState>,
) -> Result<Json<MessageBody>, RegistryError> {
    state.registry.delete_all().await?;
    Ok(Json(MessageBody::new("all mocks removed")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::registry::MockRegistry;
    use crate::storage::FallbackController;

    use super::*;

    fn create_test_state() -> AppState {
        AppState::new(Arc::new(MockRegistry::new(Arc::new(FallbackController::memory_only()))))
    }

    async fn body_json(response: Response) -> Value {
        let (_, body) = response.into_parts();
        let body_bytes = axum::body::to_bytes(body, usize::MAX).await.expect("read body");
        serde_json::from_slice(&body_bytes).expect("parse JSON")
    }

    /// Test creating a single definition.
    #[tokio::test]
    async fn test_create_single() {
        let state = create_test_state();
        let payload = json!({"uri": "/users/:id", "http_method": "get", "response": {"id": "id"}});

        let response = create_mocks(State(state.clone()), Json(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["message"], "1 mock(s) configured");
        assert_eq!(json["created"][0]["http_method"], "GET");
        assert_eq!(json["created"][0]["action"], "created");
        assert_eq!(json["errors"], json!([]));
        assert_eq!(state.registry.list_summaries().await.len(), 1);
    }

    /// Test a batch with an upsert and a rejected entry.
    #[tokio::test]
    async fn test_create_batch_reports_per_entry() {
        let state = create_test_state();
        let payload = json!([
            {"uri": "/a", "response": 1},
            {"uri": "/a", "status_code_response": 201, "response": 2},
            {"http_method": "POST", "response": {}},
            {"uri": "/b", "status_code_response": "oops", "response": {}},
        ]);

        let json = body_json(create_mocks(State(state.clone()), Json(payload)).await).await;
        assert_eq!(json["created"][0]["action"], "created");
        assert_eq!(json["created"][1]["action"], "updated");
        assert_eq!(json["created"][0]["id"], json["created"][1]["id"]);
        assert_eq!(json["errors"][0]["index"], 2);
        assert_eq!(json["errors"][1]["index"], 3);
    }

    /// Test that scalar bodies are rejected.
    #[tokio::test]
    async fn test_create_rejects_scalar_body() {
        let response = create_mocks(State(create_test_state()), Json(json!("nope"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["detail"].is_string());
    }

    /// Test get, update and delete of one mock, including not-found errors.
    #[tokio::test]
    async fn test_single_mock_lifecycle() {
        let state = create_test_state();
        let json = body_json(
            create_mocks(State(state.clone()), Json(json!({"uri": "/a", "response": {"v": 1}}))).await,
        )
        .await;
        let id = json["created"][0]["id"].as_str().expect("id").to_owned();

        let record = body_json(
            get_mock(State(state.clone()), Path(id.clone())).await.expect("found"),
        )
        .await;
        assert_eq!(record["response"], json!({"v": 1}));
        assert_eq!(record["headers"], json!({}));

        let patch = MockPatch { status_code_response: Some(503), ..MockPatch::default() };
        update_mock(State(state.clone()), Path(id.clone()), Json(patch)).await.expect("updated");
        assert_eq!(state.registry.get(&id).await.expect("present").status_code, 503);

        delete_mock(State(state.clone()), Path(id.clone())).await.expect("deleted");
        let missing = get_mock(State(state.clone()), Path(id.clone())).await;
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
        let missing = delete_mock(State(state), Path(id)).await;
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    /// Test that invalid patches map to 400.
    #[tokio::test]
    async fn test_update_validation_error() {
        let state = create_test_state();
        let created = state
            .registry
            .create_or_update(crate::registry::NewMock {
                uri: "/a".into(),
                http_method: "GET".into(),
                status_code: 200,
                response_body: json!({}),
                headers: None,
            })
            .await
            .expect("create");

        let patch = MockPatch { status_code_response: Some(7), ..MockPatch::default() };
        let result = update_mock(State(state), Path(created.id), Json(patch)).await;
        assert_eq!(result.into_response().status(), StatusCode::BAD_REQUEST);
    }

    /// Test listing and deleting everything.
    #[tokio::test]
    async fn test_list_and_delete_all() {
        let state = create_test_state();
        let payload = json!([{"uri": "/a", "response": {}}, {"uri": "/b", "response": {}}]);
        create_mocks(State(state.clone()), Json(payload)).await;

        let Json(list) = list_mocks(State(state.clone())).await;
        assert_eq!(list.mocks.len(), 2);

        delete_all_mocks(State(state.clone())).await.expect("cleared");
        let Json(list) = list_mocks(State(state)).await;
        assert!(list.mocks.is_empty());
    }
}
