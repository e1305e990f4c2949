//! Incrementally-aggregated watch-time statistics.
//!
//! [`WatchStats`] is mutated only through additive deltas via
//! [`WatchStats::apply`]; the engine persists the whole object in a single
//! FastStore write under the `stats` key. Daily buckets keep a trailing
//! window of local calendar days (pruned from "now" on every update), the
//! 24-slot hourly histogram is lifetime-cumulative and never pruned.

use std::collections::BTreeMap;

use chrono::{Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::traits::StorageError;

const STATS_SCHEMA_VERSION: u32 = 1;

/// Lifetime counters carried alongside the watch-time buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCounters {
    #[serde(default)]
    pub videos: u64,
    #[serde(default)]
    pub shorts: u64,
    #[serde(default)]
    pub total_duration_seconds: u64,
    /// Videos that crossed the completion threshold.
    #[serde(default)]
    pub completed: u64,
}

/// Aggregate usage statistics, persisted as one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchStats {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub total_watch_seconds: u64,
    /// Local calendar-day key (`YYYY-MM-DD`) to seconds watched that day.
    #[serde(default)]
    pub daily: BTreeMap<String, u64>,
    /// Seconds watched per local hour of day, lifetime-cumulative.
    #[serde(default)]
    pub hourly: [u64; 24],
    #[serde(default)]
    pub counters: WatchCounters,
    /// Epoch millis of the last applied update.
    #[serde(default)]
    pub last_updated: i64,
}

fn default_schema_version() -> u32 {
    STATS_SCHEMA_VERSION
}

impl Default for WatchStats {
    fn default() -> Self {
        Self {
            schema_version: STATS_SCHEMA_VERSION,
            total_watch_seconds: 0,
            daily: BTreeMap::new(),
            hourly: [0; 24],
            counters: WatchCounters::default(),
            last_updated: 0,
        }
    }
}

/// Optional counter increments attached to a stats update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsUpdate {
    /// Set when the update is the first sighting of a video.
    #[serde(default)]
    pub new_video: Option<NewVideo>,
    /// Set when this update crossed the completion threshold.
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVideo {
    pub duration_seconds: u64,
    #[serde(default)]
    pub is_shorts: bool,
}

impl WatchStats {
    /// Explicit defaulting at load: a missing value yields fresh stats, a
    /// stored value is deserialized with per-field defaults so objects
    /// written by older versions come up with zeroed new fields.
    pub fn from_stored(value: Option<Value>, key: &str) -> Result<Self, StorageError> {
        match value {
            None => Ok(Self::default()),
            Some(v) => serde_json::from_value(v).map_err(|e| StorageError::malformed(key, e)),
        }
    }

    /// True when nothing has ever been aggregated; the post-migration rebuild
    /// only runs in this state to avoid clobbering good data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_watch_seconds == 0 && self.counters == WatchCounters::default()
    }

    /// Apply one additive delta.
    ///
    /// Non-positive deltas are ignored entirely (no bucket or counter
    /// changes). `when_millis` picks the daily and hourly buckets; pruning of
    /// old daily keys is computed from `now_millis`, not from `when_millis`.
    /// Returns whether anything changed.
    pub fn apply(
        &mut self,
        delta_seconds: i64,
        when_millis: i64,
        update: &StatsUpdate,
        now_millis: i64,
        daily_retention_days: u32,
    ) -> bool {
        if delta_seconds <= 0 {
            return false;
        }
        let delta = delta_seconds as u64;

        self.total_watch_seconds = self.total_watch_seconds.saturating_add(delta);

        let day = local_day_key(when_millis);
        *self.daily.entry(day).or_insert(0) += delta;
        self.hourly[local_hour(when_millis)] += delta;

        if let Some(ref nv) = update.new_video {
            self.counters.videos += 1;
            self.counters.total_duration_seconds = self
                .counters
                .total_duration_seconds
                .saturating_add(nv.duration_seconds);
            if nv.is_shorts {
                self.counters.shorts += 1;
            }
        }
        if update.completed {
            self.counters.completed += 1;
        }

        self.prune_daily(now_millis, daily_retention_days);
        self.last_updated = now_millis;
        true
    }

    /// Drop daily buckets outside the trailing retention window ending today.
    pub fn prune_daily(&mut self, now_millis: i64, retention_days: u32) {
        let cutoff = retention_cutoff_key(now_millis, retention_days);
        // Day keys are YYYY-MM-DD, so lexicographic order is chronological.
        self.daily.retain(|day, _| day.as_str() >= cutoff.as_str());
    }
}

/// `YYYY-MM-DD` key for the local calendar day containing `millis`.
#[must_use]
pub fn local_day_key(millis: i64) -> String {
    let dt = Local
        .timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Local.timestamp_millis_opt(0).single().unwrap_or_default());
    format!("{:04}-{:02}-{:02}", dt.year(), dt.month(), dt.day())
}

/// Local hour-of-day (0-23) for `millis`.
#[must_use]
pub fn local_hour(millis: i64) -> usize {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.hour() as usize)
        .unwrap_or(0)
}

fn retention_cutoff_key(now_millis: i64, retention_days: u32) -> String {
    let days_back = retention_days.saturating_sub(1) as i64;
    local_day_key(now_millis - days_back * 24 * 60 * 60 * 1_000)
}

/// Downstream synchronization trigger armed by the stats aggregator.
///
/// The engine calls [`SyncHook::sync_requested`] either immediately (when the
/// settings collaborator asks for it) or from a single debounced timer.
pub trait SyncHook: Send + Sync {
    fn sync_requested(&self);
}

/// Default hook for deployments without an external sync mechanism.
#[derive(Debug, Default)]
pub struct NoopSyncHook;

impl SyncHook for NoopSyncHook {
    fn sync_requested(&self) {}
}
