//! Request and response bodies of the admin API.

use serde::{Deserialize, Serialize};

use crate::storage::{Headers, MockSummary, MockUpdate};

/// Body of `PUT /mocks/{id}`; absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct MockPatch {
    pub uri: Option<String>,
    pub http_method: Option<String>,
    pub status_code_response: Option<u16>,
    pub response: Option<serde_json::Value>,
    pub headers: Option<Headers>,
}

impl From<MockPatch> for MockUpdate {
    fn from(patch: MockPatch) -> Self {
        MockUpdate {
            uri: patch.uri,
            http_method: patch.http_method,
            status_code: patch.status_code_response,
            response_body: patch.response,
            headers: patch.headers,
        }
    }
}

/// Plain confirmation message.
#[derive(Debug, Serialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Error body of the admin API.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self { detail: detail.into() }
    }
}

/// Error body returned when no mock matches a request.
#[derive(Debug, Serialize)]
pub struct MissBody {
    pub error: String,
}

/// Whether a submitted definition produced a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateAction {
    Created,
    Updated,
}

/// One accepted definition in a create report.
#[derive(Debug, Serialize)]
pub struct CreatedMock {
    pub id: String,
    pub uri: String,
    pub http_method: String,
    pub action: CreateAction,
}

/// One rejected definition, by position in the submitted list.
#[derive(Debug, Serialize)]
pub struct CreateFailure {
    pub index: usize,
    pub error: String,
}

/// Response of `POST /mocks/configurar/endpoint`.
#[derive(Debug, Default, Serialize)]
pub struct CreateReport {
    pub message: String,
    pub created: Vec<CreatedMock>,
    pub errors: Vec<CreateFailure>,
}

/// Response of `GET /mocks`.
#[derive(Debug, Serialize)]
pub struct MockList {
    pub mocks: Vec<MockSummary>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Test that a patch maps onto the storage update field by field.
    #[test]
    fn test_patch_into_update() {
        let patch: MockPatch =
            serde_json::from_value(json!({"status_code_response": 418, "response": [1]}))
                .expect("valid JSON");
        let update = MockUpdate::from(patch);
        assert_eq!(update.status_code, Some(418));
        assert_eq!(update.response_body, Some(json!([1])));
        assert!(update.uri.is_none() && update.http_method.is_none() && update.headers.is_none());
    }

    /// Test CreateReport serialization.
    #[test]
    fn test_create_report_serialization() {
        let report = CreateReport {
            message: "1 mock(s) configured".into(),
            created: vec![CreatedMock {
                id: "000001".into(),
                uri: "/a".into(),
                http_method: "GET".into(),
                action: CreateAction::Updated,
            }],
            errors: vec![CreateFailure { index: 1, error: "bad".into() }],
        };

        let json = serde_json::to_value(&report).expect("valid structure");
        assert_eq!(json["created"][0]["action"], "updated");
        assert_eq!(json["errors"][0], json!({"index": 1, "error": "bad"}));
    }
}
