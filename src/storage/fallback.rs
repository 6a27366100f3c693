//! Storage mode state machine.
//!
//! # States
//! - Disabled: durable storage is never attempted, memory is authoritative
//! - Connected: the durable backend is reachable and every call targets it
//! - Fallback: the durable backend was configured but is unreachable; memory is
//!   authoritative and writes are not durable
//!
//! # State Transitions
//! ```text
//! init, durable off                → Disabled
//! init, probe ok                   → Connected (durable rows copied into the memory cache)
//! init, probe fails, fallback on   → Fallback
//! init, probe fails, fallback off  → startup error
//! Connected → Fallback: consecutive failures >= failure_threshold at health evaluation
//! ```
//!
//! # Read cache
//! In Connected mode the memory store is a read cache: filled at startup and, after each
//! write made through this controller, refreshed from the durable row it touched. Rows written to the durable backend
//! by anyone else are not seen by the cache. It only becomes authoritative after a
//! degradation. Writes already made to the durable backend are never migrated back.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::StoragePolicy;
use crate::storage::{MemoryStore, MockStore, StorageError};

/// What a successful write changed, so the read cache can follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touched {
    /// The record with this id was created or modified
    Record(String),
    /// The record with this id was removed
    Removed(String),
    /// Every record was removed
    All,
}

/// Which store is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Disabled,
    Connected,
    Fallback,
}

impl StorageMode {
    /// Lowercase name, as reported by the status endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Connected => "connected",
            Self::Fallback => "fallback",
        }
    }

    /// Whether durable storage was requested but is not in use.
    pub fn is_degraded(self) -> bool {
        self == Self::Fallback
    }
}

enum Target {
    Memory,
    Durable(Arc<dyn MockStore>),
}

/// Routes every storage call to the authoritative store.
pub struct FallbackController {
    policy: StoragePolicy,
    memory: Arc<MemoryStore>,
    durable: Option<Arc<dyn MockStore>>,
    mode: RwLock<StorageMode>,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackController")
            .field("policy", &self.policy)
            .field("mode", &self.mode())
            .field("durable", &self.durable.is_some())
            .finish_non_exhaustive()
    }
}

impl FallbackController {
    /// Controller that never attempts durable storage.
    pub fn memory_only() -> Self {
        Self::with_state(StoragePolicy::default(), None, StorageMode::Disabled)
    }

    /// Initialize the controller, probing the durable backend if requested.
    ///
    /// # Parameters
    ///
    /// - `policy` - Whether to use durable storage and how to treat its failures
    /// - `connect` - Opens the durable store; runs on the blocking pool under the call timeout
    ///
    /// # Returns
    ///
    /// Returns a controller in `Disabled`, `Connected` or `Fallback` mode.
    ///
    /// # Errors
    ///
    /// Returns the connection error when the backend is unreachable and fallback is not allowed.
    pub async fn initialize<F>(policy: StoragePolicy, connect: F) -> Result<Self, StorageError>
    where
        F: FnOnce() -> Result<Arc<dyn MockStore>, StorageError> + Send + 'static,
    {
        if !policy.use_durable {
            info!("durable storage disabled, using volatile memory");
            return Ok(Self::with_state(policy, None, StorageMode::Disabled));
        }

        let timeout = policy.call_timeout;
        let connected = async {
            let store = run_blocking(timeout, connect).await?;
            let probe = Arc::clone(&store);
            let records = run_blocking(timeout, move || {
                probe.ping()?;
                probe.list()
            })
            .await?;
            Ok::<_, StorageError>((store, records))
        }
        .await;

        match connected {
            Ok((store, records)) => {
                info!(cached = records.len(), "durable storage connected");
                let controller = Self::with_state(policy, Some(store), StorageMode::Connected);
                controller.memory.replace_all(records);
                Ok(controller)
            }
            Err(err) if policy.allow_fallback => {
                warn!(
                    error = %err,
                    "durable storage unreachable, falling back to volatile memory; writes will not be persisted"
                );
                Ok(Self::with_state(policy, None, StorageMode::Fallback))
            }
            Err(err) => {
                error!(error = %err, "durable storage unreachable and fallback is disabled");
                Err(err)
            }
        }
    }

    fn with_state(
        policy: StoragePolicy,
        durable: Option<Arc<dyn MockStore>>,
        mode: StorageMode,
    ) -> Self {
        Self {
            policy,
            memory: Arc::new(MemoryStore::new()),
            durable,
            mode: RwLock::new(mode),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Current storage mode.
    pub fn mode(&self) -> StorageMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Policy the controller was initialized with.
    pub fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    /// The volatile store: authoritative in Disabled/Fallback mode, read cache otherwise.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Live round trip to the durable backend.
    ///
    /// # Returns
    ///
    /// Returns `true` if a durable backend is attached and answered in time.
    pub async fn probe(&self) -> bool {
        let Some(store) = self.durable.clone() else {
            return false;
        };
        let result = run_blocking(self.policy.call_timeout, move || store.ping()).await;
        self.record(&result);
        result.is_ok()
    }

    /// Run a read against the authoritative store.
    ///
    /// # Errors
    ///
    /// Returns the store's error; durable failures also count against its health.
    pub async fn read<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&dyn MockStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        match self.target().await {
            Target::Memory => op(self.memory.as_ref()),
            Target::Durable(store) => {
                let result = run_blocking(self.policy.call_timeout, move || op(store.as_ref())).await;
                self.record(&result);
                result
            }
        }
    }

    /// Run a write against the authoritative store.
    ///
    /// A durable write is awaited to completion rather than abandoned at the call
    /// timeout; the durable store bounds its own writes and rolls back the ones it
    /// reports as failed. In Connected mode `touched` names what a successful write
    /// changed, and the cache takes that state from the durable store.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the cache is left alone on failure.
    pub async fn write<T, F, S>(&self, op: F, touched: S) -> Result<T, StorageError>
    where
        F: FnOnce(&dyn MockStore) -> Result<T, StorageError> + Send + 'static,
        S: FnOnce(&T) -> Touched,
        T: Send + 'static,
    {
        match self.target().await {
            Target::Memory => op(self.memory.as_ref()),
            Target::Durable(store) => {
                let remote = Arc::clone(&store);
                let result = match tokio::task::spawn_blocking(move || op(remote.as_ref())).await {
                    Ok(result) => result,
                    Err(join) => Err(StorageError::Task(join.to_string())),
                };
                self.record(&result);
                if let Ok(value) = &result {
                    self.refresh(store, touched(value)).await;
                }
                result
            }
        }
    }

    /// Bring the cache in line with the durable store after a write.
    async fn refresh(&self, store: Arc<dyn MockStore>, touched: Touched) {
        match touched {
            Touched::Record(id) => {
                let lookup = id.clone();
                let fetched =
                    run_blocking(self.policy.call_timeout, move || store.get(&lookup)).await;
                self.record(&fetched);
                match fetched {
                    Ok(Some(record)) => self.memory.put(record),
                    Ok(None) => {
                        self.memory.remove(&id);
                    }
                    Err(err) => {
                        // A stale entry would outlive a later degradation.
                        self.memory.remove(&id);
                        debug!(id = %id, error = %err, "read cache entry dropped");
                    }
                }
            }
            Touched::Removed(id) => {
                self.memory.remove(&id);
            }
            Touched::All => self.memory.replace_all(Vec::new()),
        }
    }

    /// Health evaluation: decides the target of the next call.
    async fn target(&self) -> Target {
        if self.mode() != StorageMode::Connected {
            return Target::Memory;
        }
        let Some(store) = self.durable.clone() else {
            return Target::Memory;
        };

        let probe = Arc::clone(&store);
        let result = run_blocking(self.policy.call_timeout, move || probe.ping()).await;
        self.record(&result);

        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures >= self.policy.failure_threshold.max(1) {
            self.degrade(failures);
            return Target::Memory;
        }
        if let Err(err) = &result {
            warn!(
                failures,
                threshold = self.policy.failure_threshold,
                error = %err,
                "durable storage probe failed"
            );
        }
        Target::Durable(store)
    }

    fn record<T>(&self, result: &Result<T, StorageError>) {
        match result {
            Ok(_) => self.consecutive_failures.store(0, Ordering::Relaxed),
            Err(err) if err.is_connectivity() => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }

    fn degrade(&self, failures: u32) {
        let mut mode = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        if *mode == StorageMode::Connected {
            *mode = StorageMode::Fallback;
            warn!(
                failures,
                "durable storage lost, falling back to volatile memory; writes will not be persisted"
            );
        }
    }
}

/// Run a blocking storage call on the blocking pool, bounded by `timeout`.
///
/// The call keeps running after a timeout, so only reads go through here.
async fn run_blocking<T, F>(timeout: Duration, op: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StorageError::Task(join.to_string())),
        Err(_) => Err(StorageError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use serde_json::json;

    use crate::storage::{Headers, MockRecord, MockUpdate, SqliteStore, Upserted};

    use super::*;

    /// Memory-backed store that can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
        slow: AtomicBool,
        slow_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StorageError> {
            if self.slow.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("connection refused".into()));
            }
            Ok(())
        }

        fn check_write(&self) -> Result<(), StorageError> {
            if self.slow_writes.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(150));
            }
            self.check()
        }
    }

    impl MockStore for FlakyStore {
        fn ping(&self) -> Result<(), StorageError> {
            self.check()
        }

        fn upsert(&self, candidate: MockRecord, update: &MockUpdate) -> Result<Upserted, StorageError> {
            self.check_write()?;
            self.inner.upsert(candidate, update)
        }

        fn get(&self, id: &str) -> Result<Option<MockRecord>, StorageError> {
            self.check()?;
            self.inner.get(id)
        }

        fn list(&self) -> Result<Vec<MockRecord>, StorageError> {
            self.check()?;
            self.inner.list()
        }

        fn update(&self, id: &str, update: &MockUpdate) -> Result<bool, StorageError> {
            self.check_write()?;
            self.inner.update(id, update)
        }

        fn delete(&self, id: &str) -> Result<bool, StorageError> {
            self.check()?;
            self.inner.delete(id)
        }

        fn delete_all(&self) -> Result<(), StorageError> {
            self.check()?;
            self.inner.delete_all()
        }
    }

    fn durable_policy() -> StoragePolicy {
        StoragePolicy {
            use_durable: true,
            allow_fallback: true,
            failure_threshold: 2,
            call_timeout: Duration::from_secs(2),
        }
    }

    fn record(id: &str, uri: &str) -> MockRecord {
        MockRecord::new(id, uri, "GET", 200, json!({}), Headers::new())
    }

    fn created(upserted: &Upserted) -> Touched {
        Touched::Record(upserted.id.clone())
    }

    async fn connected(flaky: &Arc<FlakyStore>, policy: StoragePolicy) -> FallbackController {
        let durable = Arc::clone(flaky);
        FallbackController::initialize(policy, move || Ok(durable as Arc<dyn MockStore>))
            .await
            .expect("initialize")
    }

    /// Test that a disabled controller serves everything from memory.
    #[tokio::test]
    async fn test_disabled_mode_uses_memory() {
        let controller = FallbackController::memory_only();
        assert_eq!(controller.mode(), StorageMode::Disabled);
        assert!(!controller.probe().await);

        let candidate = record("000001", "/a");
        controller
            .write(move |s| s.upsert(candidate, &MockUpdate::default()), created)
            .await
            .expect("write");

        assert_eq!(controller.memory().count().expect("count"), 1);
        assert_eq!(controller.read(|s| s.count()).await.expect("read"), 1);
    }

    /// Test that a reachable backend is used and its rows are cached at startup.
    #[tokio::test]
    async fn test_connected_mode_loads_cache_and_writes_through() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("mocks.db");
        let seeded = SqliteStore::open(&path, Duration::from_secs(1)).expect("open");
        seeded.upsert(record("000001", "/a"), &MockUpdate::default()).expect("seed");

        let controller = FallbackController::initialize(durable_policy(), move || {
            Ok(Arc::new(SqliteStore::open(&path, Duration::from_secs(1))?) as Arc<dyn MockStore>)
        })
        .await
        .expect("initialize");

        assert_eq!(controller.mode(), StorageMode::Connected);
        assert!(controller.memory().exists("000001").expect("cached"));
        assert!(controller.probe().await);

        let candidate = record("000002", "/b");
        controller
            .write(move |s| s.upsert(candidate, &MockUpdate::default()), created)
            .await
            .expect("write");

        assert!(seeded.exists("000002").expect("durable row"));
        assert!(controller.memory().exists("000002").expect("cache row"));
    }

    /// Test that an unreachable backend degrades to fallback when allowed.
    #[tokio::test]
    async fn test_unreachable_backend_enters_fallback() {
        let controller = FallbackController::initialize(durable_policy(), || {
            Err(StorageError::Unavailable("no route to host".into()))
        })
        .await
        .expect("fallback allowed");

        assert_eq!(controller.mode(), StorageMode::Fallback);
        assert!(controller.mode().is_degraded());
        assert!(!controller.probe().await);

        let candidate = record("000001", "/a");
        let outcome = controller
            .write(move |s| s.upsert(candidate, &MockUpdate::default()), created)
            .await
            .expect("volatile write");
        assert!(outcome.created);
    }

    /// Test that startup fails when the backend is unreachable and fallback is forbidden.
    #[tokio::test]
    async fn test_unreachable_backend_without_fallback_fails() {
        let policy = StoragePolicy { allow_fallback: false, ..durable_policy() };
        let result = FallbackController::initialize(policy, || {
            Err(StorageError::UnsupportedDriver("oracle".into()))
        })
        .await;

        assert!(matches!(result, Err(StorageError::UnsupportedDriver(_))));
    }

    /// Test degradation after repeated failures, without migrating earlier writes.
    #[tokio::test]
    async fn test_repeated_failures_degrade_mode() {
        let flaky = Arc::new(FlakyStore::default());
        let durable = Arc::clone(&flaky);
        let controller = FallbackController::initialize(durable_policy(), move || {
            Ok(durable as Arc<dyn MockStore>)
        })
        .await
        .expect("initialize");
        assert_eq!(controller.mode(), StorageMode::Connected);

        let candidate = record("000001", "/a");
        controller
            .write(move |s| s.upsert(candidate, &MockUpdate::default()), created)
            .await
            .expect("durable write");

        flaky.down.store(true, Ordering::SeqCst);

        // Below the threshold the failure is reported, the mode is kept.
        assert!(controller.read(|s| s.count()).await.is_err());
        assert_eq!(controller.mode(), StorageMode::Connected);

        // The next evaluation crosses the threshold and serves from memory.
        assert_eq!(controller.read(|s| s.count()).await.expect("memory read"), 1);
        assert_eq!(controller.mode(), StorageMode::Fallback);

        flaky.down.store(false, Ordering::SeqCst);
        assert_eq!(controller.mode(), StorageMode::Fallback);
        assert_eq!(flaky.inner.count().expect("count"), 1);
    }

    /// Test that a slow backend is bounded by the call timeout.
    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let flaky = Arc::new(FlakyStore::default());
        let durable = Arc::clone(&flaky);
        let policy = StoragePolicy { call_timeout: Duration::from_millis(50), ..durable_policy() };
        let controller =
            FallbackController::initialize(policy, move || Ok(durable as Arc<dyn MockStore>))
                .await
                .expect("initialize");

        flaky.slow.store(true, Ordering::SeqCst);
        let result = controller.read(|s| s.count()).await;
        assert!(matches!(result, Err(StorageError::Timeout(_))));
    }

    /// Test that a write slower than the call timeout completes in both stores.
    #[tokio::test]
    async fn test_slow_write_is_awaited() {
        let flaky = Arc::new(FlakyStore::default());
        let policy = StoragePolicy { call_timeout: Duration::from_millis(50), ..durable_policy() };
        let controller = connected(&flaky, policy).await;

        flaky.slow_writes.store(true, Ordering::SeqCst);
        let candidate = record("000001", "/a");
        let outcome = controller
            .write(move |s| s.upsert(candidate, &MockUpdate::default()), created)
            .await
            .expect("write completes");

        assert!(outcome.created);
        assert!(flaky.inner.exists("000001").expect("durable row"));
        assert!(controller.memory().exists("000001").expect("cache row"));
        assert_eq!(controller.mode(), StorageMode::Connected);
    }

    /// Test that the cache takes the durable outcome when the two disagree.
    #[tokio::test]
    async fn test_cache_follows_durable_result() {
        let flaky = Arc::new(FlakyStore::default());
        let controller = connected(&flaky, durable_policy()).await;

        // Written behind the controller's back, so the cache never saw it.
        flaky.inner.upsert(record("000005", "/a"), &MockUpdate::default()).expect("seed");

        let candidate = record("000001", "/a");
        let update = MockUpdate { status_code: Some(201), ..MockUpdate::default() };
        let outcome = controller
            .write(move |s| s.upsert(candidate, &update), created)
            .await
            .expect("write");

        assert_eq!(outcome, Upserted { id: "000005".into(), created: false });
        let cached = controller.memory().list().expect("cache");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "000005");
        assert_eq!(cached[0].status_code, 201);

        controller
            .write(|s| s.delete("000005"), |_| Touched::Removed("000005".into()))
            .await
            .expect("delete");
        assert_eq!(controller.memory().count().expect("cache"), 0);
    }
}
