//! Storage backends for the two tiers.
//!
//! - [`traits`]: the [`FastStore`] and [`ArchiveStore`] abstractions
//! - [`redis`]: Redis-backed FastStore
//! - [`sql`]: SQLite/MySQL-backed ArchiveStore
//! - [`memory`]: in-memory implementations for tests and embedded use

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::{MemoryArchiveStore, MemoryFastStore};
pub use redis::RedisFastStore;
pub use sql::SqlArchiveStore;
pub use traits::{ArchiveStore, FastStore, StorageError};
