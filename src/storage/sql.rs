//! SQL-backed ArchiveStore.
//!
//! Works against SQLite (embedded deployments) and MySQL (shared) through
//! sqlx's `Any` driver. Records are stored with their serialized JSON in a
//! `payload` column plus the columns queries actually filter and sort on:
//!
//! ```sql
//! CREATE TABLE watch_records (
//!   kind      TEXT NOT NULL,      -- 'video' | 'playlist'
//!   id        TEXT NOT NULL,
//!   timestamp INTEGER NOT NULL,   -- epoch millis, last touch
//!   title     TEXT NOT NULL,
//!   payload   TEXT NOT NULL,      -- full record as JSON
//!   PRIMARY KEY (kind, id)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! TEXT columns may come back as `Vec<u8>` depending on the backend, so every
//! text read tries `String` first and falls back to UTF-8 bytes.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;

use super::traits::{ArchiveStore, StorageError};
use crate::record::{HistoryRecord, RecordKind, Tombstone};
use crate::retry::{with_retry, RetryPolicy};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlArchiveStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlArchiveStore {
    /// Connect and initialize the schema, retrying with backoff so a bad
    /// connection string fails fast at startup.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = with_retry("sql_connect", &RetryPolicy::connect(), || async {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;

        debug!(sqlite = is_sqlite, "sql ArchiveStore ready");
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL gives concurrent reads during writes; NORMAL synchronous is safe
    /// under WAL.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {e}")))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {e}")))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS watch_records (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (kind, id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_watch_records_timestamp ON watch_records (timestamp)",
                r#"
                CREATE TABLE IF NOT EXISTS record_tombstones (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    deleted_at INTEGER NOT NULL,
                    PRIMARY KEY (kind, id)
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS watch_records (
                    kind VARCHAR(16) NOT NULL,
                    id VARCHAR(255) NOT NULL,
                    timestamp BIGINT NOT NULL,
                    title TEXT NOT NULL,
                    payload LONGTEXT NOT NULL,
                    PRIMARY KEY (kind, id),
                    INDEX idx_watch_records_timestamp (timestamp)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS record_tombstones (
                    kind VARCHAR(16) NOT NULL,
                    id VARCHAR(255) NOT NULL,
                    deleted_at BIGINT NOT NULL,
                    PRIMARY KEY (kind, id)
                )
                "#,
            ]
        };

        for sql in statements {
            with_retry("sql_init_schema", &RetryPolicy::connect(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    /// Read a TEXT column that the Any driver may surface as bytes.
    fn text_column(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
        row.try_get::<String, _>(column).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn row_to_record(row: &sqlx::any::AnyRow) -> Result<HistoryRecord, StorageError> {
        let payload = Self::text_column(row, "payload")
            .ok_or_else(|| StorageError::Backend("missing payload column".to_string()))?;
        serde_json::from_str(&payload)
            .map_err(|e| StorageError::Backend(format!("undecodable payload: {e}")))
    }

    fn upsert_record_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO watch_records (kind, id, timestamp, title, payload)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(kind, id) DO UPDATE SET
                timestamp = excluded.timestamp,
                title = excluded.title,
                payload = excluded.payload"
        } else {
            "INSERT INTO watch_records (kind, id, timestamp, title, payload)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                timestamp = VALUES(timestamp),
                title = VALUES(title),
                payload = VALUES(payload)"
        }
    }

    fn upsert_tombstone_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO record_tombstones (kind, id, deleted_at)
             VALUES (?, ?, ?)
             ON CONFLICT(kind, id) DO UPDATE SET deleted_at = excluded.deleted_at"
        } else {
            "INSERT INTO record_tombstones (kind, id, deleted_at)
             VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE deleted_at = VALUES(deleted_at)"
        }
    }
}

#[async_trait]
impl ArchiveStore for SqlArchiveStore {
    async fn put_record(&self, record: &HistoryRecord) -> Result<(), StorageError> {
        let kind = record.kind().to_string();
        let id = record.id().to_string();
        let timestamp = record.timestamp();
        let title = record.title().to_string();
        let payload =
            serde_json::to_string(record).map_err(|e| StorageError::Backend(e.to_string()))?;
        let sql = self.upsert_record_sql();

        with_retry("sql_put_record", &RetryPolicy::op(), || async {
            sqlx::query(sql)
                .bind(&kind)
                .bind(&id)
                .bind(timestamp)
                .bind(&title)
                .bind(&payload)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_record(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        let kind = kind.to_string();
        let id = id.to_string();

        with_retry("sql_get_record", &RetryPolicy::op(), || async {
            let row = sqlx::query("SELECT payload FROM watch_records WHERE kind = ? AND id = ?")
                .bind(&kind)
                .bind(&id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            row.as_ref().map(Self::row_to_record).transpose()
        })
        .await
    }

    async fn delete_record(
        &self,
        kind: RecordKind,
        id: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let kind_s = kind.to_string();
        let id_s = id.to_string();

        with_retry("sql_delete_record", &RetryPolicy::op(), || async {
            sqlx::query("DELETE FROM watch_records WHERE kind = ? AND id = ?")
                .bind(&kind_s)
                .bind(&id_s)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await?;

        if tombstone {
            let deleted_at = crate::record::now_millis();
            let sql = self.upsert_tombstone_sql();
            with_retry("sql_put_tombstone", &RetryPolicy::op(), || async {
                sqlx::query(sql)
                    .bind(&kind_s)
                    .bind(&id_s)
                    .bind(deleted_at)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn query_records(
        &self,
        kind: RecordKind,
        title_filter: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let kind = kind.to_string();
        let pattern = title_filter.map(|needle| format!("%{}%", needle.to_lowercase()));

        with_retry("sql_query_records", &RetryPolicy::op(), || async {
            let rows = match pattern {
                Some(ref pattern) => {
                    sqlx::query(
                        "SELECT payload FROM watch_records
                         WHERE kind = ? AND LOWER(title) LIKE ?
                         ORDER BY timestamp DESC",
                    )
                    .bind(&kind)
                    .bind(pattern)
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query(
                        "SELECT payload FROM watch_records WHERE kind = ? ORDER BY timestamp DESC",
                    )
                    .bind(&kind)
                    .fetch_all(&self.pool)
                    .await
                }
            }
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter().map(Self::row_to_record).collect()
        })
        .await
    }

    async fn count_records(&self, kind: RecordKind) -> Result<u64, StorageError> {
        let kind = kind.to_string();

        with_retry("sql_count_records", &RetryPolicy::op(), || async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM watch_records WHERE kind = ?")
                .bind(&kind)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(n as u64)
        })
        .await
    }

    async fn get_tombstone(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<Tombstone>, StorageError> {
        let kind_s = kind.to_string();
        let id_s = id.to_string();

        with_retry("sql_get_tombstone", &RetryPolicy::op(), || async {
            let row = sqlx::query(
                "SELECT deleted_at FROM record_tombstones WHERE kind = ? AND id = ?",
            )
            .bind(&kind_s)
            .bind(&id_s)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            row.map(|row| {
                let deleted_at: i64 = row
                    .try_get("deleted_at")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Tombstone { id: id_s.clone(), kind, deleted_at })
            })
            .transpose()
        })
        .await
    }

    async fn list_tombstones(&self, kind: RecordKind) -> Result<Vec<Tombstone>, StorageError> {
        let kind_s = kind.to_string();

        with_retry("sql_list_tombstones", &RetryPolicy::op(), || async {
            let rows = sqlx::query("SELECT id, deleted_at FROM record_tombstones WHERE kind = ?")
                .bind(&kind_s)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| {
                    let id = Self::text_column(row, "id")
                        .ok_or_else(|| StorageError::Backend("missing id column".to_string()))?;
                    let deleted_at: i64 = row
                        .try_get("deleted_at")
                        .map_err(|e| StorageError::Backend(e.to_string()))?;
                    Ok(Tombstone { id, kind, deleted_at })
                })
                .collect()
        })
        .await
    }

    async fn remove_tombstone(&self, kind: RecordKind, id: &str) -> Result<(), StorageError> {
        let kind = kind.to_string();
        let id = id.to_string();

        with_retry("sql_remove_tombstone", &RetryPolicy::op(), || async {
            sqlx::query("DELETE FROM record_tombstones WHERE kind = ? AND id = ?")
                .bind(&kind)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        for sql in ["DELETE FROM watch_records", "DELETE FROM record_tombstones"] {
            with_retry("sql_clear_all", &RetryPolicy::op(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}
