//! In-memory mock storage implementation.
//!
//! Records live in insertion order, which is also the dispatch order in
//! volatile mode. Contents are lost when the process exits.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::{MockRecord, MockStore, MockSummary, MockUpdate, StorageError, Upserted};

/// Volatile storage for mock records.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<MockRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    ///
    /// # Returns
    /// Returns a new `MemoryStore` instance with no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as the durable backend returned it.
    ///
    /// Replaces the entry with the same id in place, or appends it. Other entries
    /// claiming the same route are dropped.
    pub fn put(&self, record: MockRecord) {
        let mut records = self.write();
        records.retain(|r| r.id == record.id || !r.is_route(&record.uri, &record.http_method));
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
    }

    /// Drop the record with this id, reporting whether one was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut records = self.write();
        let before = records.len();
        records.retain(|r| r.id != id);
        records.len() != before
    }

    /// Replace the whole content, e.g. with rows loaded from the durable store.
    ///
    /// # Parameters
    ///
    /// - `records` - Records to keep, in iteration order
    pub fn replace_all(&self, records: Vec<MockRecord>) {
        *self.write() = records;
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<MockRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<MockRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockStore for MemoryStore {
    fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn upsert(&self, candidate: MockRecord, update: &MockUpdate) -> Result<Upserted, StorageError> {
        let mut records = self.write();

        if let Some(existing) =
            records.iter_mut().find(|r| r.is_route(&candidate.uri, &candidate.http_method))
        {
            existing.apply(update);
            return Ok(Upserted { id: existing.id.clone(), created: false });
        }

        let id = candidate.id.clone();
        records.push(candidate);
        Ok(Upserted { id, created: true })
    }

    fn get(&self, id: &str) -> Result<Option<MockRecord>, StorageError> {
        Ok(self.read().iter().find(|r| r.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<MockRecord>, StorageError> {
        Ok(self.read().clone())
    }

    fn list_by_method(&self, method: &str) -> Result<Vec<MockRecord>, StorageError> {
        Ok(self.read().iter().filter(|r| r.http_method == method).cloned().collect())
    }

    fn summaries(&self) -> Result<Vec<MockSummary>, StorageError> {
        Ok(self.read().iter().map(MockRecord::summary).collect())
    }

    fn update(&self, id: &str, update: &MockUpdate) -> Result<bool, StorageError> {
        let mut records = self.write();
        let Some(index) = records.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        let mut updated = records[index].clone();
        updated.apply(update);
        if let Some(owner) =
            records.iter().find(|r| r.id != id && r.is_route(&updated.uri, &updated.http_method))
        {
            return Err(StorageError::RouteTaken {
                uri: updated.uri,
                http_method: updated.http_method,
                owner: owner.id.clone(),
            });
        }

        records[index] = updated;
        Ok(true)
    }

    fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.remove(id))
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        self.write().clear();
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.read().iter().any(|r| r.id == id))
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.read().len())
    }
}
