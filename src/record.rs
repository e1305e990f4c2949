//! Watch-history record model.
//!
//! A [`HistoryRecord`] is the unit that flows through the engine: either a
//! watched video or a tracked playlist. Records are keyed by their platform id
//! and carry a last-touched timestamp in epoch millis. The id is immutable
//! once created; under normal writes the timestamp only moves forward, and
//! out-of-order arrivals are resolved higher-timestamp-wins.

use serde::{Deserialize, Serialize};

/// Kind of history record, used to namespace storage keys and to run the
/// migration engine per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Video,
    Playlist,
}

impl RecordKind {
    /// FastStore key prefix for records of this kind (`video:` / `playlist:`).
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Video => "video:",
            Self::Playlist => "playlist:",
        }
    }

    /// FastStore key holding this kind's [`MigrationState`](crate::engine::MigrationState).
    #[must_use]
    pub fn migration_state_key(&self) -> &'static str {
        match self {
            Self::Video => keys::VIDEO_MIGRATION_STATE,
            Self::Playlist => keys::PLAYLIST_MIGRATION_STATE,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Playlist => write!(f, "playlist"),
        }
    }
}

/// A watched video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    /// Platform video id. Immutable once created.
    pub id: String,
    /// Last-touched time, epoch millis.
    pub timestamp: i64,
    /// Seconds watched.
    pub time: u64,
    /// Total video duration in seconds.
    pub duration: u64,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub is_shorts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// A tracked playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistRecord {
    /// Platform playlist id. Immutable once created.
    pub id: String,
    /// Last-touched time, epoch millis.
    pub timestamp: i64,
    pub title: String,
    pub url: String,
    /// When set, videos opened from this playlist are not recorded.
    #[serde(default)]
    pub ignore_videos: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// A video or playlist history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Video(VideoRecord),
    Playlist(PlaylistRecord),
}

impl HistoryRecord {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Video(_) => RecordKind::Video,
            Self::Playlist(_) => RecordKind::Playlist,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Video(v) => &v.id,
            Self::Playlist(p) => &p.id,
        }
    }

    /// Last-touched time, epoch millis.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Video(v) => v.timestamp,
            Self::Playlist(p) => p.timestamp,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Video(v) => &v.title,
            Self::Playlist(p) => &p.title,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Video(v) => &v.url,
            Self::Playlist(p) => &p.url,
        }
    }

    /// Seconds watched. Zero for playlists, which have no watch position.
    #[must_use]
    pub fn watched_seconds(&self) -> u64 {
        match self {
            Self::Video(v) => v.time,
            Self::Playlist(_) => 0,
        }
    }

    /// Total duration in seconds. Zero for playlists.
    #[must_use]
    pub fn duration_seconds(&self) -> u64 {
        match self {
            Self::Video(v) => v.duration,
            Self::Playlist(_) => 0,
        }
    }

    /// FastStore key for this record (`video:<id>` / `playlist:<id>`).
    #[must_use]
    pub fn storage_key(&self) -> String {
        keys::record(self.kind(), self.id())
    }

    /// Check the critical fields against `other`: timestamp, watched position
    /// and url must match exactly. The migration engine deletes a FastStore
    /// copy only after this returns true for the archived copy.
    #[must_use]
    pub fn verified_equal(&self, other: &HistoryRecord) -> bool {
        self.id() == other.id()
            && self.timestamp() == other.timestamp()
            && self.watched_seconds() == other.watched_seconds()
            && self.url() == other.url()
    }

    /// Case-insensitive substring match against the title.
    #[must_use]
    pub fn title_matches(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.title().to_lowercase().contains(&needle.to_lowercase())
    }
}

/// Marker recording that a record was deleted.
///
/// A tombstone for id X means any read of X is treated as logically deleted,
/// even if a stale copy still exists in one of the stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub kind: RecordKind,
    /// Deletion time, epoch millis.
    pub deleted_at: i64,
}

/// Persisted FastStore key layout.
pub mod keys {
    use super::RecordKind;

    /// Legacy one-shot migration flag, kept for data sets written by older
    /// versions. Never written by this engine, only read and cleared.
    pub const LEGACY_MIGRATED: &str = "__migrated__";
    pub const VIDEO_MIGRATION_STATE: &str = "__idbMigrationState__";
    pub const PLAYLIST_MIGRATION_STATE: &str = "__idbPlaylistMigrationState__";
    pub const STATS: &str = "stats";
    pub const SETTINGS: &str = "settings";
    pub const TOMBSTONE_PREFIX: &str = "tombstone:";

    /// Per-record key: `video:<id>` / `playlist:<id>`.
    #[must_use]
    pub fn record(kind: RecordKind, id: &str) -> String {
        format!("{}{}", kind.prefix(), id)
    }

    /// Tombstone key: `tombstone:video:<id>` / `tombstone:playlist:<id>`.
    #[must_use]
    pub fn tombstone(kind: RecordKind, id: &str) -> String {
        format!("{}{}{}", TOMBSTONE_PREFIX, kind.prefix(), id)
    }

    /// Split a record key back into kind and id.
    #[must_use]
    pub fn parse_record(key: &str) -> Option<(RecordKind, &str)> {
        if let Some(id) = key.strip_prefix(RecordKind::Video.prefix()) {
            Some((RecordKind::Video, id))
        } else if let Some(id) = key.strip_prefix(RecordKind::Playlist.prefix()) {
            Some((RecordKind::Playlist, id))
        } else {
            None
        }
    }

    /// Split a tombstone key back into kind and id.
    #[must_use]
    pub fn parse_tombstone(key: &str) -> Option<(RecordKind, &str)> {
        parse_record(key.strip_prefix(TOMBSTONE_PREFIX)?)
    }
}

/// Current time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
