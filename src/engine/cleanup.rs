//! Retention cleanup: expired tombstones and already-synced FastStore copies.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::record::{keys, now_millis, RecordKind, Tombstone};
use crate::storage::traits::StorageError;

use super::HistoryEngine;

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub tombstones_purged: u64,
    pub records_pruned: u64,
}

impl HistoryEngine {
    /// Purge tombstones older than the configured retention from both stores.
    ///
    /// Retention exists so deletions propagate to every participant of the
    /// external sync before the marker disappears. Per-tombstone failures are
    /// logged and skipped; one bad entry must not block the rest of the pass.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_tombstones(&self) -> Result<CleanupReport, StorageError> {
        let cutoff = now_millis()
            - (self.config.tombstone_retention_days as i64) * 24 * 60 * 60 * 1_000;
        let mut report = CleanupReport::default();

        for key in self.fast.keys().await? {
            if !key.starts_with(keys::TOMBSTONE_PREFIX) {
                continue;
            }
            match self.get_json::<Tombstone>(&key).await {
                Ok(Some(ts)) if ts.deleted_at < cutoff => {
                    self.fast.remove(&key).await?;
                    report.tombstones_purged += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(key, error = %e, "unreadable tombstone skipped"),
            }
        }

        if let Some(ref archive) = self.archive {
            for kind in [RecordKind::Video, RecordKind::Playlist] {
                match archive.list_tombstones(kind).await {
                    Ok(tombstones) => {
                        for ts in tombstones {
                            if ts.deleted_at >= cutoff {
                                continue;
                            }
                            match archive.remove_tombstone(ts.kind, &ts.id).await {
                                Ok(()) => report.tombstones_purged += 1,
                                Err(e) => {
                                    warn!(id = %ts.id, error = %e, "archive tombstone purge failed")
                                }
                            }
                        }
                    }
                    Err(e) => warn!(kind = %kind, error = %e, "archive tombstone listing failed"),
                }
            }
        }

        if report.tombstones_purged > 0 {
            info!(purged = report.tombstones_purged, "expired tombstones purged");
            crate::metrics::record_tombstones_purged(report.tombstones_purged);
        }
        Ok(report)
    }

    /// Prune FastStore copies that the external sync no longer needs.
    ///
    /// Runs only when sync is enabled and the archive is present. A copy is
    /// pruned when all three hold: the sync index acknowledges the id, the
    /// archive verifiably holds the record, and the record is older than the
    /// recent window. Failing any check keeps the copy; losing an unsynced
    /// record is worse than carrying a stale one.
    #[tracing::instrument(skip(self, sync_index), fields(kind = %kind))]
    pub async fn cleanup_synced_records(
        &self,
        kind: RecordKind,
        sync_index: &HashSet<String>,
    ) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();

        if !self.settings.sync_enabled() {
            debug!("sync disabled, nothing to prune");
            return Ok(report);
        }
        let Some(ref archive) = self.archive else {
            debug!("archive unavailable, prune deferred");
            return Ok(report);
        };

        let recent_window = self.config.recent_window_millis();
        let now = now_millis();

        for record in self.fast_records(kind).await? {
            if now - record.timestamp() <= recent_window {
                continue;
            }
            if !sync_index.contains(record.id()) {
                continue;
            }
            let archived = match archive.get_record(kind, record.id()).await {
                Ok(stored) => stored.is_some_and(|s| s.verified_equal(&record)),
                Err(e) => {
                    warn!(id = %record.id(), error = %e, "archive check failed, copy retained");
                    continue;
                }
            };
            if !archived {
                continue;
            }
            if let Err(e) = self.fast.remove(&record.storage_key()).await {
                warn!(id = %record.id(), error = %e, "prune failed, copy retained");
                continue;
            }
            report.records_pruned += 1;
        }

        if report.records_pruned > 0 {
            info!(pruned = report.records_pruned, "synced records pruned from FastStore");
        }
        Ok(report)
    }
}
