use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::record::{HistoryRecord, RecordKind, Tombstone};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Malformed stored value for '{key}': {reason}")]
    Malformed { key: String, reason: String },
}

impl StorageError {
    pub(crate) fn malformed(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The always-available key-value store.
///
/// Sole authority for any record not yet verified-archived; also holds
/// tombstones, stats and migration state. Writes land here first and must
/// never wait on the archive.
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;

    /// Enumerate every stored key. Used by migration and the merge-query
    /// overlay; backing stores here hold at most a few thousand entries.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// The durable, queryable archival store.
///
/// Authority for archived/cold records. May be absent or unavailable; every
/// call site treats failure as recoverable and falls back to FastStore-only
/// behavior.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Insert or overwrite a record (upsert by kind + id).
    async fn put_record(&self, record: &HistoryRecord) -> Result<(), StorageError>;

    async fn get_record(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<HistoryRecord>, StorageError>;

    /// Delete a record; when `tombstone` is set, an archive-side tombstone is
    /// recorded alongside the deletion.
    async fn delete_record(
        &self,
        kind: RecordKind,
        id: &str,
        tombstone: bool,
    ) -> Result<(), StorageError>;

    /// All records of a kind whose title contains `title_filter`
    /// (case-insensitive); `None` matches everything. The merge-query layer
    /// merges this base set with the FastStore overlay before paginating.
    async fn query_records(
        &self,
        kind: RecordKind,
        title_filter: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, StorageError>;

    async fn count_records(&self, kind: RecordKind) -> Result<u64, StorageError>;

    async fn get_tombstone(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<Tombstone>, StorageError>;

    async fn list_tombstones(&self, kind: RecordKind) -> Result<Vec<Tombstone>, StorageError>;

    async fn remove_tombstone(&self, kind: RecordKind, id: &str) -> Result<(), StorageError>;

    /// Drop all records and tombstones. Only invoked by a full data clear.
    async fn clear_all(&self) -> Result<(), StorageError>;
}
