//! # history-engine
//!
//! Tiered local storage and migration engine for a personal watch-history
//! tracker.
//!
//! ## Architecture
//!
//! ```text
//!   writes ──► FastStore (always available, KV over JSON)
//!                 │   ▲
//!    migration    │   │ recent-window hydration
//!    (batched,    ▼   │
//!     verified) ArchiveStore (durable, queryable, may be absent)
//! ```
//!
//! - **FastStore** ([`storage::FastStore`]): always-available key-value
//!   store. Every write lands here first; it also holds tombstones, stats
//!   and migration state. Backed by Redis ([`storage::RedisFastStore`]) or
//!   memory ([`storage::MemoryFastStore`]).
//! - **ArchiveStore** ([`storage::ArchiveStore`]): durable queryable
//!   archive, backed by SQLite/MySQL ([`storage::SqlArchiveStore`]). May be
//!   absent; everything degrades to FastStore-only behavior.
//! - **Migration** ([`HistoryEngine::run_migration`]): moves records to the
//!   archive in fixed batches, deleting a FastStore copy only after
//!   read-back verification, with resumable persisted state.
//! - **Merge queries** ([`HistoryEngine::query_history`]): archive base set
//!   merged with the FastStore overlay (overlay wins on newer-or-equal
//!   timestamp), filtered, sorted and paginated with page clamping.
//! - **Tombstones**: deletions leave retention-bounded markers so they
//!   propagate through external sync instead of resurrecting.
//! - **Stats** ([`HistoryEngine::update_stats`]): total, trailing daily and
//!   hour-of-day watch-time aggregates with a debounced sync trigger.
//! - **Proxy** ([`CallProxy`] / [`EngineClient`]): non-owner contexts
//!   forward operations to the single owner process, with timeout, backoff
//!   retries and a local-write fallback when the owner is unreachable.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use history_engine::{EngineConfig, HistoryEngine, HistoryRecord, RecordKind, VideoRecord};
//! use history_engine::storage::{MemoryArchiveStore, MemoryFastStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), history_engine::StorageError> {
//! let engine = HistoryEngine::new(EngineConfig::default(), Arc::new(MemoryFastStore::new()))
//!     .with_archive(Arc::new(MemoryArchiveStore::new()));
//!
//! engine
//!     .write_record(&HistoryRecord::Video(VideoRecord {
//!         id: "dQw4w9WgXcQ".into(),
//!         timestamp: 1_700_000_000_000,
//!         time: 212,
//!         duration: 213,
//!         title: "Never Gonna Give You Up".into(),
//!         url: "https://example.com/watch?v=dQw4w9WgXcQ".into(),
//!         is_shorts: false,
//!         channel_name: None,
//!         channel_id: None,
//!     }))
//!     .await?;
//!
//! let record = engine.read_record(RecordKind::Video, "dQw4w9WgXcQ").await?;
//! assert!(record.is_some());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod metrics;
pub mod proxy;
pub mod record;
pub mod retry;
pub mod stats;
pub mod storage;

pub use config::{EngineConfig, EngineRole, Settings, StaticSettings};
pub use engine::{
    CleanupReport, HistoryEngine, HistoryPage, ImportReport, MigrationRun, MigrationState,
    MigrationStatus, PageRequest, SortField, SortOrder,
};
pub use proxy::{
    CallProxy, EngineClient, OwnerTransport, ProxyError, RpcRequest, RpcResponse, TransportError,
};
pub use record::{HistoryRecord, PlaylistRecord, RecordKind, Tombstone, VideoRecord};
pub use stats::{NewVideo, NoopSyncHook, StatsUpdate, SyncHook, WatchStats};
pub use storage::{ArchiveStore, FastStore, StorageError};
