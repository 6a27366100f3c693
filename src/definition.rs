//! Wire shape of a mock definition, shared by the admin API and seed files.

use serde::{Deserialize, Serialize};

use crate::registry::{NewMock, RegistryError};
use crate::storage::Headers;

/// Method used when a definition leaves `http_method` out.
pub const DEFAULT_METHOD: &str = "GET";

/// Status code used when a definition leaves `status_code_response` out.
pub const DEFAULT_STATUS_CODE: u16 = 200;

/// A mock as submitted by a client: `uri` and `response` are required, the rest
/// falls back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockDefinition {
    /// URI template, e.g. `/users/:id`.
    pub uri: Option<String>,
    /// HTTP method, case-insensitive (`GET` by default).
    pub http_method: Option<String>,
    /// Status code of the canned response (200 by default).
    pub status_code_response: Option<u16>,
    /// Canned response body. JSON `null` counts as missing.
    pub response: Option<serde_json::Value>,
    /// Extra response headers.
    pub headers: Option<Headers>,
}

impl MockDefinition {
    /// Check required fields and apply defaults.
    ///
    /// # Returns
    ///
    /// Returns a `NewMock` with an uppercase method.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Validation` when `uri` or `response` is missing.
    pub fn into_new_mock(self) -> Result<NewMock, RegistryError> {
        let uri = self
            .uri
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| RegistryError::Validation("missing required field `uri`".into()))?;
        let response_body = self
            .response
            .ok_or_else(|| RegistryError::Validation("missing required field `response`".into()))?;

        Ok(NewMock {
            uri,
            http_method: self
                .http_method
                .as_deref()
                .unwrap_or(DEFAULT_METHOD)
                .trim()
                .to_ascii_uppercase(),
            status_code: self.status_code_response.unwrap_or(DEFAULT_STATUS_CODE),
            response_body,
            headers: self.headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Test defaults for method and status code.
    #[test]
    fn test_defaults_applied() {
        let definition: MockDefinition =
            serde_json::from_value(json!({"uri": "/ping", "response": {"ok": true}}))
                .expect("valid definition");

        let mock = definition.into_new_mock().expect("valid");
        assert_eq!(mock.http_method, "GET");
        assert_eq!(mock.status_code, 200);
        assert!(mock.headers.is_none());
    }

    /// Test that the method is normalized to uppercase.
    #[test]
    fn test_method_uppercased() {
        let definition = MockDefinition {
            uri: Some("/ping".into()),
            http_method: Some("post".into()),
            response: Some(json!("pong")),
            ..MockDefinition::default()
        };
        assert_eq!(definition.into_new_mock().expect("valid").http_method, "POST");
    }

    /// Test that missing uri or response is rejected.
    #[test]
    fn test_required_fields() {
        let no_uri = MockDefinition { response: Some(json!({})), ..MockDefinition::default() };
        assert!(matches!(no_uri.into_new_mock(), Err(RegistryError::Validation(_))));

        let null_response: MockDefinition =
            serde_json::from_value(json!({"uri": "/a", "response": null})).expect("parses");
        assert!(matches!(null_response.into_new_mock(), Err(RegistryError::Validation(_))));
    }
}
