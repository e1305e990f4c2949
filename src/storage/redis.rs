//! Redis-backed FastStore.
//!
//! Values are stored as JSON strings under prefixed keys, so a shared Redis
//! instance can host the history namespace next to other applications.
//! `ConnectionManager` handles reconnection internally; the initial
//! connection is retried with backoff so a bad connection string surfaces at
//! startup instead of hanging.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use tracing::debug;

use super::traits::{FastStore, StorageError};
use crate::retry::{with_retry, RetryPolicy};

pub struct RedisFastStore {
    connection: ConnectionManager,
    /// Prepended to every key (e.g. `history:` → `history:video.abc`).
    prefix: String,
}

impl RedisFastStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix for namespacing.
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = with_retry("redis_connect", &RetryPolicy::connect(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        debug!(prefix = prefix.unwrap_or(""), "redis FastStore connected");
        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// All stored keys, with the prefix stripped.
    async fn scan_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefix);
        let mut keys = Vec::new();
        {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            while let Some(key) = iter.next_item().await {
                keys.push(
                    key.strip_prefix(&self.prefix)
                        .map(str::to_string)
                        .unwrap_or(key),
                );
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(self.prefixed(key))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match raw {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| StorageError::malformed(key, e)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let raw = serde_json::to_string(value).map_err(|e| StorageError::Backend(e.to_string()))?;
        conn.set::<_, _, ()>(self.prefixed(key), raw)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.prefixed(key))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed(k)).collect();
        conn.del::<_, ()>(prefixed)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.scan_keys().await
    }
}
