//! Request dispatch: resolves an incoming request to a registered mock and renders its
//! response body.
//!
//! Candidates are the records registered for the request method, tried in the
//! authoritative store's order; the first whose pattern matches the whole path wins.
//! Variables are merged from three sources, later ones overriding earlier ones:
//!
//! 1. named path segments,
//! 2. query parameters,
//! 3. top-level keys of a JSON object body.
//!
//! Substitution walks the stored body and replaces every string that is exactly the name
//! of a variable with that variable's value. Partial matches inside longer strings are
//! left alone.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use fnv::FnvHashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::pattern::UriPattern;
use crate::registry::MockRegistry;
use crate::storage::Headers;

/// Compiled patterns kept before the cache is reset.
const PATTERN_CACHE_LIMIT: usize = 1024;

/// Variables available to substitution, keyed by name.
pub type Variables = FnvHashMap<String, Value>;

/// The parts of an HTTP request dispatch looks at.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Decoded query parameters in request order.
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// A rendered mock response.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    pub mock_id: String,
    pub status_code: u16,
    pub body: Value,
    pub headers: Headers,
}

/// Result of dispatching one request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Matched(DispatchResponse),
    Miss,
}

/// Matches requests against the registry.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<MockRegistry>,
    patterns: RwLock<FnvHashMap<String, UriPattern>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<MockRegistry>) -> Self {
        Self { registry, patterns: RwLock::new(FnvHashMap::default()) }
    }

    /// Find the first mock matching the request and render its response.
    pub async fn dispatch(&self, request: &DispatchRequest) -> DispatchOutcome {
        let method = request.method.to_ascii_uppercase();

        for record in self.registry.records_for_method(&method).await {
            let Some(pattern) = self.pattern(&record.uri_pattern) else {
                continue;
            };
            let Some(captures) = pattern.captures(&request.path) else {
                continue;
            };

            let variables = collect_variables(captures, &request.query, request.body.as_deref());
            debug!(id = %record.id, method = %method, path = %request.path, "mock matched");
            return DispatchOutcome::Matched(DispatchResponse {
                body: substitute(&record.response_body, &variables),
                mock_id: record.id,
                status_code: record.status_code,
                headers: record.headers,
            });
        }

        debug!(method = %method, path = %request.path, "no mock matched");
        DispatchOutcome::Miss
    }

    fn pattern(&self, pattern: &str) -> Option<UriPattern> {
        if let Some(compiled) =
            self.patterns.read().unwrap_or_else(PoisonError::into_inner).get(pattern)
        {
            return Some(compiled.clone());
        }

        let compiled = match UriPattern::from_pattern(pattern) {
            Ok(compiled) => compiled,
            Err(err) => {
                warn!(error = %err, "skipping mock with unusable pattern");
                return None;
            }
        };

        let mut cache = self.patterns.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= PATTERN_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(pattern.to_owned(), compiled.clone());
        Some(compiled)
    }
}

/// Merge path captures, query parameters and JSON object body keys, in that order of
/// increasing precedence.
///
/// A body that is empty, not JSON, or not an object contributes nothing.
pub fn collect_variables(
    captures: Vec<(String, String)>,
    query: &[(String, String)],
    body: Option<&[u8]>,
) -> Variables {
    let mut variables: Variables =
        captures.into_iter().map(|(name, value)| (name, Value::String(value))).collect();

    for (name, value) in query {
        variables.insert(name.clone(), Value::String(value.clone()));
    }

    if let Some(body) = body.filter(|body| !body.is_empty()) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => variables.extend(fields),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "request body is not JSON; ignoring it"),
        }
    }

    variables
}

/// Replace every string equal to a variable name with the variable's value.
///
/// Object keys are never substituted; arrays and objects are walked recursively.
pub fn substitute(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::String(text) => variables.get(text).cloned().unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute(item, variables)).collect()),
        Value::Object(fields) => Value::Object(
            fields.iter().map(|(key, item)| (key.clone(), substitute(item, variables))).collect(),
        ),
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::registry::NewMock;
    use crate::storage::FallbackController;

    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    async fn registry_with(mocks: &[(&str, &str, Value)]) -> Arc<MockRegistry> {
        let registry = Arc::new(MockRegistry::new(Arc::new(FallbackController::memory_only())));
        for (uri, method, body) in mocks {
            registry
                .create_or_update(NewMock {
                    uri: (*uri).into(),
                    http_method: (*method).into(),
                    status_code: 200,
                    response_body: body.clone(),
                    headers: None,
                })
                .await
                .expect("create");
        }
        registry
    }

    fn get(path: &str) -> DispatchRequest {
        DispatchRequest { method: "GET".into(), path: path.into(), ..DispatchRequest::default() }
    }

    /// Test substitution of exact string matches only.
    #[test]
    fn test_substitute_exact_strings() {
        let variables = vars(&[("id", json!("42")), ("user", json!({"name": "ana"}))]);
        let body = json!({
            "id": "id",
            "label": "id of user",
            "owner": "user",
            "list": ["id", 7, null, true],
        });

        assert_eq!(
            substitute(&body, &variables),
            json!({
                "id": "42",
                "label": "id of user",
                "owner": {"name": "ana"},
                "list": ["42", 7, null, true],
            })
        );
    }

    /// Test that a body without variables is returned unchanged.
    #[test]
    fn test_substitute_no_variables() {
        let body = json!({"a": [1, "b", {"c": false}]});
        assert_eq!(substitute(&body, &Variables::default()), body);
    }

    /// Test precedence: path, then query, then body.
    #[test]
    fn test_variable_precedence() {
        let captures = vec![("id".to_owned(), "from-path".to_owned())];
        let query = vec![("id".to_owned(), "from-query".to_owned()), ("q".to_owned(), "x".to_owned())];

        let variables = collect_variables(captures.clone(), &query, None);
        assert_eq!(variables["id"], json!("from-query"));
        assert_eq!(variables["q"], json!("x"));

        let body = br#"{"id": 99, "extra": [1]}"#;
        let variables = collect_variables(captures, &query, Some(body));
        assert_eq!(variables["id"], json!(99));
        assert_eq!(variables["extra"], json!([1]));
    }

    /// Test that non-object and malformed bodies are ignored.
    #[test]
    fn test_ignored_bodies() {
        let captures = vec![("id".to_owned(), "1".to_owned())];
        let bodies: [&[u8]; 4] = [b"not json", b"[1, 2]", b"\"id\"", b""];
        for body in bodies {
            let variables = collect_variables(captures.clone(), &[], Some(body));
            assert_eq!(variables, vars(&[("id", json!("1"))]));
        }
    }

    /// Test the canonical path-variable example end to end.
    #[tokio::test]
    async fn test_dispatch_substitutes_path_variable() {
        let registry = registry_with(&[("/users/:id", "GET", json!({"userId": "id", "name": "John"}))]).await;
        let dispatcher = Dispatcher::new(registry);

        let DispatchOutcome::Matched(response) = dispatcher.dispatch(&get("/users/42")).await else {
            panic!("expected a match");
        };
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, json!({"userId": "42", "name": "John"}));
        assert!(response.headers.is_empty());
    }

    /// Test misses on method, path depth and unknown paths.
    #[tokio::test]
    async fn test_dispatch_miss() {
        let registry = registry_with(&[("/users/:id", "GET", json!({}))]).await;
        let dispatcher = Dispatcher::new(registry);

        assert_eq!(dispatcher.dispatch(&get("/users/42/extra")).await, DispatchOutcome::Miss);
        assert_eq!(dispatcher.dispatch(&get("/accounts/42")).await, DispatchOutcome::Miss);

        let post = DispatchRequest { method: "POST".into(), ..get("/users/42") };
        assert_eq!(dispatcher.dispatch(&post).await, DispatchOutcome::Miss);
    }

    /// Test that the first registered matching mock wins and method case is ignored.
    #[tokio::test]
    async fn test_dispatch_first_match_wins() {
        let registry = registry_with(&[
            ("/items/:id", "GET", json!("first")),
            ("/items/(?P<code>[0-9]+)", "GET", json!("second")),
        ])
        .await;
        let dispatcher = Dispatcher::new(registry);

        let request = DispatchRequest { method: "get".into(), ..get("/items/7") };
        let DispatchOutcome::Matched(response) = dispatcher.dispatch(&request).await else {
            panic!("expected a match");
        };
        assert_eq!(response.body, json!("first"));
    }

    /// Test query and body variables reaching the rendered body.
    #[tokio::test]
    async fn test_dispatch_query_and_body_variables() {
        let registry =
            registry_with(&[("/orders/:orderId", "POST", json!({"order": "orderId", "by": "customer"}))])
                .await;
        let dispatcher = Dispatcher::new(registry);

        let request = DispatchRequest {
            method: "POST".into(),
            path: "/orders/A1".into(),
            query: vec![("customer".into(), "from-query".into())],
            body: Some(Bytes::from_static(br#"{"customer": {"id": 5}}"#)),
        };
        let DispatchOutcome::Matched(response) = dispatcher.dispatch(&request).await else {
            panic!("expected a match");
        };
        assert_eq!(response.body, json!({"order": "A1", "by": {"id": 5}}));
    }
}
