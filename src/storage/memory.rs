//! In-memory store implementations.
//!
//! `MemoryFastStore` is the default FastStore when no backend is configured;
//! both stores double as substitutable fakes for the engine's tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::traits::{ArchiveStore, FastStore, StorageError};
use crate::record::{HistoryRecord, RecordKind, Tombstone};

pub struct MemoryFastStore {
    data: DashMap<String, Value>,
}

impl MemoryFastStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.iter().map(|r| r.key().clone()).collect())
    }
}

pub struct MemoryArchiveStore {
    records: DashMap<(RecordKind, String), HistoryRecord>,
    tombstones: DashMap<(RecordKind, String), Tombstone>,
}

impl MemoryArchiveStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            tombstones: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Seed a tombstone directly, bypassing `delete_record`'s timestamping.
    pub fn insert_tombstone(&self, tombstone: Tombstone) {
        self.tombstones
            .insert((tombstone.kind, tombstone.id.clone()), tombstone);
    }
}

impl Default for MemoryArchiveStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn put_record(&self, record: &HistoryRecord) -> Result<(), StorageError> {
        self.records
            .insert((record.kind(), record.id().to_string()), record.clone());
        Ok(())
    }

    async fn get_record(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        Ok(self
            .records
            .get(&(kind, id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn delete_record(
        &self,
        kind: RecordKind,
        id: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        self.records.remove(&(kind, id.to_string()));
        if tombstone {
            self.tombstones.insert(
                (kind, id.to_string()),
                Tombstone {
                    id: id.to_string(),
                    kind,
                    deleted_at: crate::record::now_millis(),
                },
            );
        }
        Ok(())
    }

    async fn query_records(
        &self,
        kind: RecordKind,
        title_filter: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.key().0 == kind)
            .map(|r| r.value().clone())
            .filter(|rec| title_filter.map_or(true, |needle| rec.title_matches(needle)))
            .collect())
    }

    async fn count_records(&self, kind: RecordKind) -> Result<u64, StorageError> {
        Ok(self.records.iter().filter(|r| r.key().0 == kind).count() as u64)
    }

    async fn get_tombstone(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<Tombstone>, StorageError> {
        Ok(self
            .tombstones
            .get(&(kind, id.to_string()))
            .map(|t| t.value().clone()))
    }

    async fn list_tombstones(&self, kind: RecordKind) -> Result<Vec<Tombstone>, StorageError> {
        Ok(self
            .tombstones
            .iter()
            .filter(|t| t.key().0 == kind)
            .map(|t| t.value().clone())
            .collect())
    }

    async fn remove_tombstone(&self, kind: RecordKind, id: &str) -> Result<(), StorageError> {
        self.tombstones.remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.records.clear();
        self.tombstones.clear();
        Ok(())
    }
}
