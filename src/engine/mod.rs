//! History engine coordinator.
//!
//! [`HistoryEngine`] ties the tiered storage together:
//! - FastStore: always-available key-value store, written synchronously
//! - ArchiveStore: durable queryable archive, populated by batch migration
//! - Merge-query layer producing consistent paginated views across both
//! - Tombstone bookkeeping, sync-aware cleanup and incremental stats
//!
//! Writes always land in the FastStore first and never wait on the archive;
//! the archive is filled in by [`run_migration`](HistoryEngine::run_migration)
//! batch runs, which delete a FastStore copy only after a read-back
//! verification of the archived copy.

mod cleanup;
mod migration;
mod query;
mod rpc;

pub use cleanup::CleanupReport;
pub use migration::{MigrationRun, MigrationState, MigrationStatus};
pub use query::{HistoryPage, PageRequest, SortField, SortOrder};

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, EngineRole, Settings, StaticSettings};
use crate::record::{keys, now_millis, HistoryRecord, RecordKind, Tombstone};
use crate::stats::{NoopSyncHook, StatsUpdate, SyncHook, WatchStats};
use crate::storage::traits::{ArchiveStore, FastStore, StorageError};

/// Outcome of a bulk import: every entry is validated before any mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    /// Valid records written to the FastStore.
    pub imported: usize,
    /// Valid records skipped because a newer local copy exists.
    pub skipped_stale: usize,
    /// Entries rejected as malformed.
    pub rejected: usize,
}

/// Main coordinator over the tiered stores.
///
/// # Thread safety
///
/// All operations take `&self`; the engine is `Send + Sync` and safe to share
/// behind an `Arc`. Concurrent writers to the same id resolve
/// last-write-wins in the FastStore.
pub struct HistoryEngine {
    pub(super) config: EngineConfig,
    pub(super) fast: Arc<dyn FastStore>,
    /// May be absent; every call site degrades to FastStore-only behavior.
    pub(super) archive: Option<Arc<dyn ArchiveStore>>,
    pub(super) settings: Arc<dyn Settings>,
    pub(super) sync_hook: Arc<dyn SyncHook>,
    /// The single outstanding debounce timer for the stats sync trigger.
    pub(super) stats_sync_timer: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryEngine {
    pub fn new(config: EngineConfig, fast: Arc<dyn FastStore>) -> Self {
        if config.role == EngineRole::Proxy {
            warn!("engine constructed with proxy role; use EngineClient to reach the owner");
        }
        Self {
            config,
            fast,
            archive: None,
            settings: Arc::new(StaticSettings::default()),
            sync_hook: Arc::new(NoopSyncHook),
            stats_sync_timer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = Some(archive);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Arc<dyn Settings>) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_sync_hook(mut self, hook: Arc<dyn SyncHook>) -> Self {
        self.sync_hook = hook;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the archive capability is currently configured.
    #[must_use]
    pub fn archive_available(&self) -> bool {
        self.archive.is_some()
    }

    // --- Tiered read/write path ---

    /// Write a record to the FastStore.
    ///
    /// Never waits on or fails due to the archive; archival happens on the
    /// migration cadence. Fires the downstream sync trigger when the settings
    /// collaborator asks for immediate sync.
    #[tracing::instrument(skip(self, record), fields(kind = %record.kind(), id = %record.id()))]
    pub async fn write_record(&self, record: &HistoryRecord) -> Result<(), StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("fast", "write");
        let value = serde_json::to_value(record)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.fast.set(&record.storage_key(), &value).await?;
        crate::metrics::record_operation("fast", "write", "success");

        if self.settings.immediate_sync() {
            self.sync_hook.sync_requested();
        }
        Ok(())
    }

    /// Read a record: FastStore first, archive fallback.
    ///
    /// The fast path is always correct for the most recent write because
    /// writes land there first. An archive hit whose timestamp falls within
    /// the recent window is hydrated back into the FastStore; hydration
    /// failure is non-fatal. A tombstoned id reads as absent even if a stale
    /// copy survives in either store.
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    pub async fn read_record(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("engine", "read");
        if self.fast_tombstone(kind, id).await?.is_some() {
            debug!("read suppressed by tombstone");
            return Ok(None);
        }

        if let Some(record) = self.fast_record(kind, id).await? {
            crate::metrics::record_operation("fast", "read", "hit");
            return Ok(Some(record));
        }

        let Some(ref archive) = self.archive else {
            crate::metrics::record_operation("fast", "read", "miss");
            return Ok(None);
        };

        match archive.get_record(kind, id).await {
            Ok(Some(record)) => {
                crate::metrics::record_operation("archive", "read", "hit");
                let age = now_millis() - record.timestamp();
                if age <= self.config.recent_window_millis() {
                    // Cached directly instead of through write_record: a read
                    // must not fire the immediate-sync trigger.
                    if let Err(e) = self.set_json(&record.storage_key(), &record).await {
                        warn!(error = %e, "hydration into FastStore failed");
                    } else {
                        debug!("archive hit hydrated into FastStore");
                    }
                }
                Ok(Some(record))
            }
            Ok(None) => {
                crate::metrics::record_operation("archive", "read", "miss");
                Ok(None)
            }
            Err(e) => {
                // Archive unavailability is recoverable, not a caller failure.
                warn!(error = %e, "archive lookup failed");
                crate::metrics::record_operation("archive", "read", "error");
                Ok(None)
            }
        }
    }

    /// Remove a record from both stores and leave a tombstone.
    ///
    /// Succeeds from the caller's point of view even when the archive delete
    /// fails; the tombstone is written unconditionally.
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    pub async fn remove_record(&self, kind: RecordKind, id: &str) -> Result<(), StorageError> {
        self.fast.remove(&keys::record(kind, id)).await?;

        let tombstone = Tombstone {
            id: id.to_string(),
            kind,
            deleted_at: now_millis(),
        };
        self.set_json(&keys::tombstone(kind, id), &tombstone).await?;

        if let Some(ref archive) = self.archive {
            if let Err(e) = archive.delete_record(kind, id, true).await {
                warn!(error = %e, "archive delete failed, tombstone retained");
                crate::metrics::record_operation("archive", "delete", "error");
            } else {
                crate::metrics::record_operation("archive", "delete", "success");
            }
        }

        info!("record removed");
        Ok(())
    }

    /// Validate and import a batch of raw records.
    ///
    /// Malformed entries are rejected up front; nothing is written until the
    /// whole batch is validated. Valid entries merge higher-timestamp-wins
    /// against existing FastStore copies.
    pub async fn import_records(&self, raw: Vec<Value>) -> Result<ImportReport, StorageError> {
        let mut valid = Vec::with_capacity(raw.len());
        let mut report = ImportReport::default();

        for entry in raw {
            match serde_json::from_value::<HistoryRecord>(entry) {
                Ok(record) if !record.id().is_empty() && record.timestamp() >= 0 => {
                    valid.push(record);
                }
                _ => report.rejected += 1,
            }
        }

        for record in valid {
            let existing = self.fast_record(record.kind(), record.id()).await?;
            if existing.is_some_and(|e| e.timestamp() > record.timestamp()) {
                report.skipped_stale += 1;
                continue;
            }
            self.write_record(&record).await?;
            report.imported += 1;
        }

        info!(
            imported = report.imported,
            skipped_stale = report.skipped_stale,
            rejected = report.rejected,
            "import finished"
        );
        Ok(report)
    }

    /// Full data clear: both stores, including stats and migration state.
    ///
    /// The only operation allowed to reset a completed [`MigrationState`].
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        self.fast.clear().await?;
        if let Some(ref archive) = self.archive {
            archive.clear_all().await?;
        }
        info!("all history data cleared");
        Ok(())
    }

    /// Snapshot of the persisted `settings` object, with absent or
    /// pre-schema fields defaulting to disabled.
    pub async fn load_settings(&self) -> Result<StaticSettings, StorageError> {
        Ok(self.get_json(keys::SETTINGS).await?.unwrap_or_default())
    }

    // --- Stats aggregation ---

    /// Current stats, with explicit defaulting for missing or pre-schema
    /// objects.
    pub async fn stats(&self) -> Result<WatchStats, StorageError> {
        let stored = self.fast.get(keys::STATS).await?;
        WatchStats::from_stored(stored, keys::STATS)
    }

    /// Apply one additive watch-time delta and persist the stats object in a
    /// single write.
    ///
    /// Non-positive deltas are ignored. The downstream sync trigger fires
    /// immediately under the immediate-sync setting, otherwise a single
    /// debounced timer is armed; re-arming while a timer is pending is a
    /// no-op.
    #[tracing::instrument(skip(self, update))]
    pub async fn update_stats(
        &self,
        delta_seconds: i64,
        when_millis: i64,
        update: &StatsUpdate,
    ) -> Result<(), StorageError> {
        let now = now_millis();
        let mut stats = match self.stats().await {
            Ok(stats) => stats,
            Err(StorageError::Malformed { key, reason }) => {
                warn!(key, reason, "stored stats unreadable, starting fresh");
                WatchStats::default()
            }
            Err(e) => return Err(e),
        };

        if !stats.apply(
            delta_seconds,
            when_millis,
            update,
            now,
            self.config.daily_retention_days,
        ) {
            return Ok(());
        }

        self.set_json(keys::STATS, &stats).await?;
        crate::metrics::record_watch_seconds(delta_seconds as u64);

        self.trigger_stats_sync().await;
        Ok(())
    }

    async fn trigger_stats_sync(&self) {
        if self.settings.immediate_sync() {
            self.sync_hook.sync_requested();
            return;
        }

        let mut timer = self.stats_sync_timer.lock();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("stats sync timer already pending");
            return;
        }

        let hook = Arc::clone(&self.sync_hook);
        let delay = Duration::from_secs(self.config.stats_debounce_secs);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            hook.sync_requested();
        }));
        debug!(delay_secs = self.config.stats_debounce_secs, "stats sync timer armed");
    }

    // --- FastStore helpers ---

    pub(super) async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.fast.set(key, &value).await
    }

    pub(super) async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.fast.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StorageError::malformed(key, e)),
            None => Ok(None),
        }
    }

    pub(super) async fn fast_record(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<HistoryRecord>, StorageError> {
        self.get_json(&keys::record(kind, id)).await
    }

    pub(super) async fn fast_tombstone(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<Tombstone>, StorageError> {
        self.get_json(&keys::tombstone(kind, id)).await
    }

    /// All FastStore record keys of a kind (skips tombstones and state keys).
    pub(super) async fn fast_record_keys(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .fast
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(kind.prefix()))
            .collect())
    }

    /// All FastStore records of a kind; unreadable values are skipped with a
    /// warning rather than failing the enumeration.
    pub(super) async fn fast_records(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let mut records = Vec::new();
        for key in self.fast_record_keys(kind).await? {
            match self.get_json::<HistoryRecord>(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VideoRecord;
    use crate::storage::memory::{MemoryArchiveStore, MemoryFastStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn video(id: &str, timestamp: i64) -> HistoryRecord {
        HistoryRecord::Video(VideoRecord {
            id: id.to_string(),
            timestamp,
            time: 60,
            duration: 300,
            title: format!("Video {id}"),
            url: format!("https://example.com/watch?v={id}"),
            is_shorts: false,
            channel_name: None,
            channel_id: None,
        })
    }

    fn engine() -> HistoryEngine {
        HistoryEngine::new(EngineConfig::default(), Arc::new(MemoryFastStore::new()))
    }

    struct CountingHook(AtomicUsize);

    impl SyncHook for CountingHook {
        fn sync_requested(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips() {
        let engine = engine();
        let rec = video("a", now_millis());

        engine.write_record(&rec).await.unwrap();
        let got = engine.read_record(RecordKind::Video, "a").await.unwrap();
        assert_eq!(got, Some(rec));
    }

    #[tokio::test]
    async fn test_read_missing_without_archive() {
        let engine = engine();
        assert!(engine.read_record(RecordKind::Video, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstone_and_suppresses_reads() {
        let archive = Arc::new(MemoryArchiveStore::new());
        let engine = engine().with_archive(archive.clone());
        let rec = video("a", now_millis());

        engine.write_record(&rec).await.unwrap();
        archive.put_record(&rec).await.unwrap();

        engine.remove_record(RecordKind::Video, "a").await.unwrap();

        // Gone from both stores, tombstoned in both.
        assert!(engine.read_record(RecordKind::Video, "a").await.unwrap().is_none());
        assert!(archive.get_record(RecordKind::Video, "a").await.unwrap().is_none());
        assert!(engine.fast_tombstone(RecordKind::Video, "a").await.unwrap().is_some());
        assert!(archive.get_tombstone(RecordKind::Video, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tombstone_suppresses_stale_archive_copy() {
        let archive = Arc::new(MemoryArchiveStore::new());
        let engine = engine().with_archive(archive.clone());

        engine.write_record(&video("a", now_millis())).await.unwrap();
        engine.remove_record(RecordKind::Video, "a").await.unwrap();
        // A stale copy resurfaces in the archive (e.g. written elsewhere).
        archive.put_record(&video("a", now_millis())).await.unwrap();

        assert!(engine.read_record(RecordKind::Video, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_hit_hydrates_recent_record() {
        let archive = Arc::new(MemoryArchiveStore::new());
        let engine = engine().with_archive(archive.clone());

        let recent = video("recent", now_millis() - 60_000);
        archive.put_record(&recent).await.unwrap();

        let got = engine.read_record(RecordKind::Video, "recent").await.unwrap();
        assert_eq!(got, Some(recent.clone()));
        // Hydrated copy now serves the fast path.
        assert_eq!(engine.fast_record(RecordKind::Video, "recent").await.unwrap(), Some(recent));
    }

    #[tokio::test]
    async fn test_archive_hit_outside_recent_window_not_hydrated() {
        let archive = Arc::new(MemoryArchiveStore::new());
        let engine = engine().with_archive(archive.clone());

        let old = video("old", now_millis() - 2 * 60 * 60 * 1_000);
        archive.put_record(&old).await.unwrap();

        let got = engine.read_record(RecordKind::Video, "old").await.unwrap();
        assert_eq!(got, Some(old));
        assert!(engine.fast_record(RecordKind::Video, "old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hydration_does_not_fire_sync_trigger() {
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let archive = Arc::new(MemoryArchiveStore::new());
        let engine = engine()
            .with_archive(archive.clone())
            .with_settings(Arc::new(StaticSettings { sync_enabled: false, immediate_sync: true }))
            .with_sync_hook(hook.clone());

        let recent = video("recent", now_millis() - 60_000);
        archive.put_record(&recent).await.unwrap();

        let got = engine.read_record(RecordKind::Video, "recent").await.unwrap();
        assert_eq!(got, Some(recent.clone()));
        assert_eq!(engine.fast_record(RecordKind::Video, "recent").await.unwrap(), Some(recent));
        // A pure read has no side effect beyond the cached copy.
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_before_any_write() {
        let engine = engine();
        let now = now_millis();

        let raw = vec![
            serde_json::to_value(video("ok1", now)).unwrap(),
            json!({"kind": "video", "id": "broken"}),
            json!(42),
            serde_json::to_value(video("ok2", now)).unwrap(),
        ];

        let report = engine.import_records(raw).await.unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.rejected, 2);
        assert!(engine.read_record(RecordKind::Video, "ok1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_import_keeps_newer_local_copy() {
        let engine = engine();
        let now = now_millis();

        engine.write_record(&video("a", now)).await.unwrap();
        let report = engine
            .import_records(vec![serde_json::to_value(video("a", now - 1_000)).unwrap()])
            .await
            .unwrap();

        assert_eq!(report.skipped_stale, 1);
        assert_eq!(report.imported, 0);
        let got = engine.read_record(RecordKind::Video, "a").await.unwrap().unwrap();
        assert_eq!(got.timestamp(), now);
    }

    #[tokio::test]
    async fn test_update_stats_persists_single_object() {
        let engine = engine();
        let now = now_millis();

        engine.update_stats(60, now, &StatsUpdate::default()).await.unwrap();
        engine.update_stats(-1, now, &StatsUpdate::default()).await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_watch_seconds, 60);
    }

    #[tokio::test]
    async fn test_stats_sync_debounced_to_single_timer() {
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let config = EngineConfig { stats_debounce_secs: 0, ..Default::default() };
        let engine = HistoryEngine::new(config, Arc::new(MemoryFastStore::new()))
            .with_sync_hook(hook.clone());
        let now = now_millis();

        // Both updates land while at most one timer may be outstanding.
        engine.update_stats(10, now, &StatsUpdate::default()).await.unwrap();
        engine.update_stats(10, now, &StatsUpdate::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let fired = hook.0.load(Ordering::SeqCst);
        assert!(fired >= 1 && fired <= 2, "debounce collapsed timers, got {fired}");
    }

    #[tokio::test]
    async fn test_immediate_sync_fires_hook_directly() {
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let settings = StaticSettings { sync_enabled: false, immediate_sync: true };
        let engine = HistoryEngine::new(EngineConfig::default(), Arc::new(MemoryFastStore::new()))
            .with_settings(Arc::new(settings))
            .with_sync_hook(hook.clone());

        engine.write_record(&video("a", now_millis())).await.unwrap();
        engine
            .update_stats(10, now_millis(), &StatsUpdate::default())
            .await
            .unwrap();

        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_settings_defaults_and_parses() {
        let engine = engine();
        assert!(!engine.load_settings().await.unwrap().sync_enabled);

        engine
            .set_json(keys::SETTINGS, &json!({"sync_enabled": true, "theme": "dark"}))
            .await
            .unwrap();
        let settings = engine.load_settings().await.unwrap();
        assert!(settings.sync_enabled);
        assert!(!settings.immediate_sync);
    }

    #[tokio::test]
    async fn test_clear_all_wipes_both_stores() {
        let archive = Arc::new(MemoryArchiveStore::new());
        let engine = engine().with_archive(archive.clone());

        engine.write_record(&video("a", now_millis())).await.unwrap();
        archive.put_record(&video("b", now_millis())).await.unwrap();
        engine.update_stats(10, now_millis(), &StatsUpdate::default()).await.unwrap();

        engine.clear_all().await.unwrap();

        assert!(engine.read_record(RecordKind::Video, "a").await.unwrap().is_none());
        assert!(archive.is_empty());
        assert!(engine.stats().await.unwrap().is_empty());
    }
}
