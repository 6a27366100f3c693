//! Mock record storage abstractions and implementations.
//!
//! This module defines the record model and the [`MockStore`] trait shared by the
//! volatile in-process store and the durable SQLite store. The
//! [`FallbackController`] decides which of the two is authoritative for each call.

pub mod fallback;
pub mod memory;
pub mod sqlite;

// Re-export main implementations
pub use fallback::{FallbackController, StorageMode, Touched};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::pattern;

/// Custom response headers, kept sorted for stable output.
pub type Headers = BTreeMap<String, String>;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite driver error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored JSON column could not be encoded or decoded.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The configured driver has no backend in this build.
    #[error("unsupported storage driver `{0}`")]
    UnsupportedDriver(String),
    /// The backend did not answer within the configured timeout.
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    /// The blocking task running the call failed.
    #[error("storage task failed: {0}")]
    Task(String),
    /// The backend cannot be reached.
    #[error("durable storage unavailable: {0}")]
    Unavailable(String),
    /// The backing table has a layout this build cannot use.
    #[error("schema: {0}")]
    Schema(String),
    /// An update would give a record the route another record already owns.
    #[error("{http_method} {uri} is already registered as mock {owner}")]
    RouteTaken { uri: String, http_method: String, owner: String },
}

impl StorageError {
    /// Whether this error says something about backend reachability.
    ///
    /// Serialization errors and route conflicts concern a single row; every other
    /// failure counts against the backend's health.
    pub fn is_connectivity(&self) -> bool {
        !matches!(self, Self::Json(_) | Self::RouteTaken { .. })
    }
}

/// Storage abstraction for mock records.
///
/// Implementations are synchronous; the fallback controller moves durable calls off
/// the async runtime. Reads are bounded by the controller's timeout. Writes are awaited
/// to completion, so a durable store must bound its own writes and must not commit
/// one it reports as failed.
pub trait MockStore: Send + Sync {
    /// Cheap round trip proving the backend is reachable.
    fn ping(&self) -> Result<(), StorageError>;

    /// Insert `candidate`, or apply `update` to the record already registered for the
    /// same `(uri, http_method)` pair.
    ///
    /// # Returns
    ///
    /// Returns the id of the record that now holds the definition and whether it was
    /// newly created.
    fn upsert(&self, candidate: MockRecord, update: &MockUpdate) -> Result<Upserted, StorageError>;

    /// Fetch one record by id.
    fn get(&self, id: &str) -> Result<Option<MockRecord>, StorageError>;

    /// All records in the backend's iteration order.
    fn list(&self) -> Result<Vec<MockRecord>, StorageError>;

    /// Records registered for one (uppercase) HTTP method, in iteration order.
    fn list_by_method(&self, method: &str) -> Result<Vec<MockRecord>, StorageError> {
        Ok(self.list()?.into_iter().filter(|r| r.http_method == method).collect())
    }

    /// Summaries of all records, without response bodies or headers.
    fn summaries(&self) -> Result<Vec<MockSummary>, StorageError> {
        Ok(self.list()?.iter().map(MockRecord::summary).collect())
    }

    /// Apply a partial update.
    ///
    /// # Returns
    ///
    /// Returns `false` if no record has the given id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::RouteTaken`, leaving the record untouched, when the new
    /// `(uri, http_method)` belongs to another record.
    fn update(&self, id: &str, update: &MockUpdate) -> Result<bool, StorageError>;

    /// Remove one record. Returns `false` if no record has the given id.
    fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Remove every record.
    fn delete_all(&self) -> Result<(), StorageError>;

    /// Check whether a record with the given id exists.
    fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.get(id)?.is_some())
    }

    /// Number of stored records.
    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.list()?.len())
    }
}

/// A stored association of method + URI template with a canned response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockRecord {
    /// Fixed-width decimal identifier.
    pub id: String,
    /// URI template, may contain `:name` segments.
    pub uri: String,
    /// Pattern compiled from `uri`, never edited independently.
    pub uri_pattern: String,
    /// Uppercase HTTP method.
    pub http_method: String,
    /// Status code of the canned response.
    pub status_code: u16,
    /// Canned response body.
    #[serde(rename = "response")]
    pub response_body: serde_json::Value,
    /// Extra response headers.
    #[serde(default)]
    pub headers: Headers,
    /// Creation time (durable mode only).
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<OffsetDateTime>,
    /// Last update time (durable mode only).
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<OffsetDateTime>,
}

impl MockRecord {
    /// Create a new record, deriving `uri_pattern` from `uri`.
    ///
    /// # Parameters
    ///
    /// - `id` - Record identifier
    /// - `uri` - URI template
    /// - `http_method` - Uppercase HTTP method
    /// - `status_code` - Response status code
    /// - `response_body` - Response body
    /// - `headers` - Response headers
    ///
    /// # Returns
    ///
    /// Returns a new `MockRecord` without timestamps.
    pub fn new(
        id: impl Into<String>,
        uri: impl Into<String>,
        http_method: impl Into<String>,
        status_code: u16,
        response_body: serde_json::Value,
        headers: Headers,
    ) -> Self {
        let uri = uri.into();
        Self {
            id: id.into(),
            uri_pattern: pattern::compile(&uri),
            uri,
            http_method: http_method.into(),
            status_code,
            response_body,
            headers,
            created_at: None,
            updated_at: None,
        }
    }

    /// Apply the provided fields of a partial update, recompiling the pattern when
    /// the template changes.
    pub fn apply(&mut self, update: &MockUpdate) {
        if let Some(status_code) = update.status_code {
            self.status_code = status_code;
        }
        if let Some(body) = &update.response_body {
            self.response_body = body.clone();
        }
        if let Some(uri) = &update.uri {
            self.uri_pattern = pattern::compile(uri);
            self.uri = uri.clone();
        }
        if let Some(method) = &update.http_method {
            self.http_method = method.clone();
        }
        if let Some(headers) = &update.headers {
            self.headers = headers.clone();
        }
    }

    /// Whether this record is registered for the given template and method.
    pub fn is_route(&self, uri: &str, http_method: &str) -> bool {
        self.uri == uri && self.http_method == http_method
    }

    /// Listing view of this record.
    pub fn summary(&self) -> MockSummary {
        MockSummary {
            id: self.id.clone(),
            uri: self.uri.clone(),
            http_method: self.http_method.clone(),
            status_code: self.status_code,
        }
    }
}

/// Listing view of a record; bodies and headers are left out on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockSummary {
    pub id: String,
    pub uri: String,
    pub http_method: String,
    pub status_code: u16,
}

/// Partial update; only `Some` fields change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockUpdate {
    pub status_code: Option<u16>,
    pub response_body: Option<serde_json::Value>,
    pub uri: Option<String>,
    pub http_method: Option<String>,
    pub headers: Option<Headers>,
}

impl MockUpdate {
    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status_code.is_none()
            && self.response_body.is_none()
            && self.uri.is_none()
            && self.http_method.is_none()
            && self.headers.is_none()
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// Id of the record holding the definition.
    pub id: String,
    /// `true` if a new record was inserted, `false` if an existing one was updated.
    pub created: bool,
}
