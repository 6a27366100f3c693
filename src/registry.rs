//! Mock registry: the create/read/update/delete contract over mock records.
//!
//! Every operation is routed through the [`FallbackController`] to whichever store is
//! currently authoritative. Creation is an upsert keyed by `(uri, http_method)`: a second
//! definition for the same route updates the existing record and keeps its id. No
//! conflict error is ever raised for duplicates.
//!
//! Mutations are serialized by an async gate so id allocation and upsert see a
//! consistent view; reads and dispatch never take it.
//!
//! # Lifecycle
//!
//! Initialize a [`FallbackController`], wrap it in `Arc`, build the registry with
//! [`MockRegistry::new`] and share it by `Arc`. Call [`MockRegistry::shutdown`] once the
//! server has stopped accepting requests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use fnv::FnvHashSet;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::pattern::{PatternError, UriPattern};
use crate::storage::{
    FallbackController, Headers, MockRecord, MockSummary, MockUpdate, StorageError, StorageMode,
    Touched, Upserted,
};

/// Number of decimal digits in a generated id.
pub const ID_WIDTH: u32 = 6;

/// Random draws before falling back to a full scan of the id space.
const RANDOM_ID_ATTEMPTS: usize = 64;

/// Ids handed out by `generate_id` that are held back from later allocations.
const LEASED_ID_LIMIT: usize = 4096;

/// Errors reported by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Input rejected before touching storage.
    #[error("invalid mock: {0}")]
    Validation(String),
    /// No record has the given id.
    #[error("mock {0} not found")]
    NotFound(String),
    /// The authoritative store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Every id of the configured width is taken.
    #[error("no free mock id left")]
    IdSpaceExhausted,
}

impl From<PatternError> for RegistryError {
    fn from(err: PatternError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// A validated mock definition ready to be registered.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMock {
    pub uri: String,
    pub http_method: String,
    pub status_code: u16,
    pub response_body: serde_json::Value,
    /// `None` keeps the headers of an existing record on upsert, and means no headers
    /// on insert.
    pub headers: Option<Headers>,
}

/// Snapshot reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    /// Result of a live probe of the durable backend.
    pub connected: bool,
    pub storage_mode: StorageMode,
    /// Durable storage was requested but writes are going to volatile memory.
    pub degraded: bool,
    pub total_count: usize,
    pub use_durable: bool,
    pub fallback_allowed: bool,
}

/// Recently generated ids, oldest first once the limit is reached.
#[derive(Debug, Default)]
struct IdLeases {
    ids: FnvHashSet<String>,
    order: VecDeque<String>,
}

impl IdLeases {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > LEASED_ID_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Owns the mock contract; storage decisions are delegated to the controller.
#[derive(Debug)]
pub struct MockRegistry {
    storage: Arc<FallbackController>,
    writes: tokio::sync::Mutex<()>,
    leases: Mutex<IdLeases>,
    id_width: u32,
}

impl MockRegistry {
    /// Create a registry over an initialized controller.
    pub fn new(storage: Arc<FallbackController>) -> Self {
        Self::with_id_width(storage, ID_WIDTH)
    }

    /// Create a registry generating ids of `id_width` digits (1 to 9).
    pub fn with_id_width(storage: Arc<FallbackController>, id_width: u32) -> Self {
        Self {
            storage,
            writes: tokio::sync::Mutex::new(()),
            leases: Mutex::new(IdLeases::default()),
            id_width: id_width.clamp(1, 9),
        }
    }

    /// Produce a fixed-width decimal id not visible in the authoritative store.
    ///
    /// The most recent ids handed out are held back from later allocations, so concurrent
    /// callers never receive the same id. Past a few thousand outstanding ids the oldest
    /// is released again.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::IdSpaceExhausted` once every id is taken, or a storage error.
    pub async fn generate_id(&self) -> Result<String, RegistryError> {
        let _gate = self.writes.lock().await;
        let id = self.allocate_id().await?;
        self.lock_leases().insert(id.clone());
        Ok(id)
    }

    /// Register a mock, or update the one already registered for its route.
    ///
    /// # Returns
    ///
    /// Returns the id holding the definition and whether it was newly created.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for bad input, or `Storage` if the write failed. A failed
    /// write leaves no partial record behind.
    pub async fn create_or_update(&self, mock: NewMock) -> Result<Upserted, RegistryError> {
        let http_method = normalize_method(&mock.http_method)?;
        let status_code = validate_status(mock.status_code)?;
        validate_uri(&mock.uri)?;

        // The gate is held until the insert lands, so the id needs no lease.
        let _gate = self.writes.lock().await;
        let id = self.allocate_id().await?;

        let candidate = MockRecord::new(
            id,
            mock.uri,
            http_method,
            status_code,
            mock.response_body.clone(),
            mock.headers.clone().unwrap_or_default(),
        );
        let redefinition = MockUpdate {
            status_code: Some(status_code),
            response_body: Some(mock.response_body),
            headers: mock.headers,
            ..MockUpdate::default()
        };

        let outcome = self
            .storage
            .write(
                move |store| store.upsert(candidate, &redefinition),
                |upserted| Touched::Record(upserted.id.clone()),
            )
            .await?;
        info!(id = %outcome.id, created = outcome.created, "mock registered");
        Ok(outcome)
    }

    /// Full record, response body and headers included.
    ///
    /// Storage failures are logged and reported as absent.
    pub async fn get(&self, id: &str) -> Option<MockRecord> {
        let key = id.to_owned();
        match self.storage.read(move |store| store.get(&key)).await {
            Ok(record) => record,
            Err(err) => {
                error!(id, error = %err, "failed to read mock");
                None
            }
        }
    }

    /// Id, uri, method and status of every record.
    ///
    /// Storage failures are logged and reported as an empty list.
    pub async fn list_summaries(&self) -> Vec<MockSummary> {
        match self.storage.read(|store| store.summaries()).await {
            Ok(summaries) => summaries,
            Err(err) => {
                error!(error = %err, "failed to list mocks");
                Vec::new()
            }
        }
    }

    /// Records registered for one method, in the authoritative store's order.
    pub async fn records_for_method(&self, method: &str) -> Vec<MockRecord> {
        let method = method.to_ascii_uppercase();
        match self.storage.read(move |store| store.list_by_method(&method)).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "failed to load mocks for dispatch");
                Vec::new()
            }
        }
    }

    /// Apply a partial update; a new `uri` recompiles the pattern in the same write.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `Validation` for bad fields or a route already
    /// held by another record, `Storage` on failure.
    pub async fn update(&self, id: &str, mut changes: MockUpdate) -> Result<(), RegistryError> {
        if let Some(status_code) = changes.status_code {
            validate_status(status_code)?;
        }
        if let Some(uri) = &changes.uri {
            validate_uri(uri)?;
        }
        if let Some(method) = changes.http_method.take() {
            changes.http_method = Some(normalize_method(&method)?);
        }

        let _gate = self.writes.lock().await;
        let key = id.to_owned();
        let touched = Touched::Record(id.to_owned());
        let written = self.storage.write(move |store| store.update(&key, &changes), |_| touched);
        let updated = match written.await {
            Ok(updated) => updated,
            Err(err @ StorageError::RouteTaken { .. }) => {
                return Err(RegistryError::Validation(err.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if !updated {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        info!(id, "mock updated");
        Ok(())
    }

    /// Remove one record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `Storage` on failure.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let _gate = self.writes.lock().await;
        let key = id.to_owned();
        let touched = Touched::Removed(id.to_owned());
        if !self.storage.write(move |store| store.delete(&key), |_| touched).await? {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        info!(id, "mock removed");
        Ok(())
    }

    /// Remove every record.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on failure.
    pub async fn delete_all(&self) -> Result<(), RegistryError> {
        let _gate = self.writes.lock().await;
        self.storage.write(|store| store.delete_all(), |_| Touched::All).await?;
        info!("all mocks removed");
        Ok(())
    }

    /// Whether a record with the given id exists. Storage failures count as absent.
    pub async fn exists(&self, id: &str) -> bool {
        let key = id.to_owned();
        match self.storage.read(move |store| store.exists(&key)).await {
            Ok(exists) => exists,
            Err(err) => {
                error!(id, error = %err, "failed to check mock");
                false
            }
        }
    }

    /// Controller and registry status.
    pub async fn status(&self) -> RegistryStatus {
        let storage_mode = self.storage.mode();
        let connected = self.storage.probe().await;
        let total_count = match self.storage.read(|store| store.count()).await {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, "failed to count mocks");
                0
            }
        };
        let policy = self.storage.policy();

        RegistryStatus {
            connected,
            storage_mode,
            degraded: storage_mode.is_degraded(),
            total_count,
            use_durable: policy.use_durable,
            fallback_allowed: policy.allow_fallback,
        }
    }

    /// Log the final state before the process exits.
    pub async fn shutdown(&self) {
        let _gate = self.writes.lock().await;
        let status = self.status().await;
        if status.storage_mode != StorageMode::Connected && status.total_count > 0 {
            warn!(
                mocks = status.total_count,
                mode = status.storage_mode.as_str(),
                "volatile mocks are discarded on exit"
            );
        }
        info!(mode = status.storage_mode.as_str(), "mock registry shut down");
    }

    async fn allocate_id(&self) -> Result<String, RegistryError> {
        let space = 10u32.pow(self.id_width);

        for _ in 0..RANDOM_ID_ATTEMPTS {
            let candidate = self.format_id(rand::random::<u32>() % space);
            if self.lock_leases().contains(&candidate) {
                continue;
            }
            let key = candidate.clone();
            if !self.storage.read(move |store| store.exists(&key)).await? {
                return Ok(candidate);
            }
        }

        // Crowded id space: walk it once so the search always terminates.
        let taken: FnvHashSet<String> = self
            .storage
            .read(|store| Ok(store.summaries()?.into_iter().map(|s| s.id).collect()))
            .await?;
        let leases = self.lock_leases();
        for n in 0..space {
            let candidate = self.format_id(n);
            if !taken.contains(&candidate) && !leases.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::IdSpaceExhausted)
    }

    fn format_id(&self, n: u32) -> String {
        format!("{n:0width$}", width = self.id_width as usize)
    }

    fn lock_leases(&self) -> std::sync::MutexGuard<'_, IdLeases> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn normalize_method(method: &str) -> Result<String, RegistryError> {
    let method = method.trim();
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RegistryError::Validation(format!("invalid http method `{method}`")));
    }
    Ok(method.to_ascii_uppercase())
}

fn validate_status(status_code: u16) -> Result<u16, RegistryError> {
    if (100..=999).contains(&status_code) {
        Ok(status_code)
    } else {
        Err(RegistryError::Validation(format!("invalid status code {status_code}")))
    }
}

fn validate_uri(uri: &str) -> Result<(), RegistryError> {
    if uri.trim().is_empty() {
        return Err(RegistryError::Validation("uri must not be empty".into()));
    }
    UriPattern::from_template(uri)?;
    Ok(())
}
