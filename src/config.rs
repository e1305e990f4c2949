//! Configuration for the history engine.
//!
//! # Example
//!
//! ```
//! use history_engine::{EngineConfig, EngineRole};
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.recent_window_secs, 30 * 60);
//! assert_eq!(config.migration_batch_size, 50);
//!
//! // Full config
//! let config = EngineConfig {
//!     role: EngineRole::Owner,
//!     migration_batch_size: 100,
//!     stats_debounce_secs: 60,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Which side of the cross-context boundary this process is.
///
/// Set explicitly at startup instead of sniffing the runtime environment:
/// the `Owner` holds direct store access and serves RPC calls, a `Proxy`
/// forwards every call through [`EngineClient`](crate::proxy::EngineClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineRole {
    Owner,
    Proxy,
}

impl std::fmt::Display for EngineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

/// Configuration for the history engine.
///
/// All fields have sensible defaults matching the documented behavior of the
/// storage subsystem; override only what a deployment actually changes.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Process role (see [`EngineRole`]).
    #[serde(default = "default_role")]
    pub role: EngineRole,

    /// Records touched within this window stay in the FastStore even after
    /// they are verified-archived (default: 30 minutes).
    #[serde(default = "default_recent_window_secs")]
    pub recent_window_secs: u64,

    /// Migration batch size; migration state is persisted after every batch
    /// (default: 50).
    #[serde(default = "default_migration_batch_size")]
    pub migration_batch_size: usize,

    /// Tombstones older than this are purged by cleanup (default: 30 days).
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u32,

    /// Daily stats buckets older than this are pruned on every update
    /// (default: trailing 7 calendar days).
    #[serde(default = "default_daily_retention_days")]
    pub daily_retention_days: u32,

    /// Watched fraction at which a video counts as completed (default: 0.9).
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: f64,

    /// Debounce window for the downstream stats sync trigger
    /// (default: 10 minutes).
    #[serde(default = "default_stats_debounce_secs")]
    pub stats_debounce_secs: u64,

    /// Timeout on the proxy's first attempt; retries run without one
    /// (default: 3 seconds).
    #[serde(default = "default_proxy_first_timeout_ms")]
    pub proxy_first_timeout_ms: u64,

    /// Base delay for proxy retry backoff, doubled per attempt
    /// (default: 200 ms).
    #[serde(default = "default_proxy_backoff_base_ms")]
    pub proxy_backoff_base_ms: u64,

    /// Maximum proxy retries after the first attempt (default: 4).
    #[serde(default = "default_proxy_max_retries")]
    pub proxy_max_retries: u32,
}

fn default_role() -> EngineRole { EngineRole::Owner }
fn default_recent_window_secs() -> u64 { 30 * 60 }
fn default_migration_batch_size() -> usize { 50 }
fn default_tombstone_retention_days() -> u32 { 30 }
fn default_daily_retention_days() -> u32 { 7 }
fn default_completion_threshold() -> f64 { 0.9 }
fn default_stats_debounce_secs() -> u64 { 10 * 60 }
fn default_proxy_first_timeout_ms() -> u64 { 3_000 }
fn default_proxy_backoff_base_ms() -> u64 { 200 }
fn default_proxy_max_retries() -> u32 { 4 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            recent_window_secs: default_recent_window_secs(),
            migration_batch_size: default_migration_batch_size(),
            tombstone_retention_days: default_tombstone_retention_days(),
            daily_retention_days: default_daily_retention_days(),
            completion_threshold: default_completion_threshold(),
            stats_debounce_secs: default_stats_debounce_secs(),
            proxy_first_timeout_ms: default_proxy_first_timeout_ms(),
            proxy_backoff_base_ms: default_proxy_backoff_base_ms(),
            proxy_max_retries: default_proxy_max_retries(),
        }
    }
}

impl EngineConfig {
    /// Recent window as millis, for comparison against record timestamps.
    #[must_use]
    pub fn recent_window_millis(&self) -> i64 {
        (self.recent_window_secs as i64) * 1_000
    }
}

/// External settings collaborator.
///
/// Exposes the flags this core consults but does not own. The external
/// synchronization mechanism reads records out of the FastStore, which is why
/// migration must not delete them while `sync_enabled` is true.
pub trait Settings: Send + Sync {
    /// Whether an external synchronization mechanism is active.
    fn sync_enabled(&self) -> bool;

    /// When set, writes and stats updates fire the downstream sync trigger
    /// immediately instead of waiting for the debounce cadence.
    fn immediate_sync(&self) -> bool {
        false
    }
}

/// Fixed settings snapshot, for tests, single-process deployments and the
/// persisted `settings` object.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StaticSettings {
    #[serde(default)]
    pub sync_enabled: bool,
    #[serde(default)]
    pub immediate_sync: bool,
}

impl Settings for StaticSettings {
    fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    fn immediate_sync(&self) -> bool {
        self.immediate_sync
    }
}
