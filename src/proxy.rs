//! Cross-context call proxy.
//!
//! Only one process (the owner) holds direct store access; every other
//! context forwards operations through [`CallProxy`] over an
//! [`OwnerTransport`]. The first attempt carries a timeout so a dead owner is
//! detected quickly; retries then back off with a doubling delay. When every
//! attempt fails the caller gets the distinguished
//! [`ProxyError::OwnerUnavailable`], and [`EngineClient`] degrades writes to
//! a local-only FastStore fallback so no watch event is ever dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{HistoryPage, PageRequest};
use crate::record::{HistoryRecord, RecordKind};
use crate::stats::{StatsUpdate, WatchStats};
use crate::storage::traits::{FastStore, StorageError};

/// One forwarded operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: &str, args: Vec<Value>) -> Self {
        Self { method: method.to_string(), args }
    }
}

/// Wire envelope for a forwarded result. Exactly one of `result` / `error`
/// is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(result: Value) -> Self {
        Self { result: Some(result), error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { result: None, error: Some(message.into()) }
    }
}

/// Transport-level failure, as distinguished from an error the owner
/// returned.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The owner context did not answer (closed channel, no receiver).
    #[error("owner context unavailable")]
    Unavailable,
    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Every attempt timed out or found no owner. Callers with a local
    /// fallback should take it on this variant.
    #[error("history owner unavailable after retries")]
    OwnerUnavailable,
    /// The owner answered with an error; retrying would repeat it.
    #[error("owner returned error: {0}")]
    Remote(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Codec(String),
}

/// Delivery mechanism to the owner context.
#[async_trait]
pub trait OwnerTransport: Send + Sync {
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, TransportError>;
}

/// Retrying forwarder over an [`OwnerTransport`].
pub struct CallProxy {
    transport: Arc<dyn OwnerTransport>,
    first_timeout: Duration,
    backoff_base: Duration,
    max_retries: u32,
}

impl CallProxy {
    pub fn new(config: &EngineConfig, transport: Arc<dyn OwnerTransport>) -> Self {
        Self {
            transport,
            first_timeout: Duration::from_millis(config.proxy_first_timeout_ms),
            backoff_base: Duration::from_millis(config.proxy_backoff_base_ms),
            max_retries: config.proxy_max_retries,
        }
    }

    /// Forward one request, retrying transient failures.
    ///
    /// The first attempt is bounded by the configured timeout; retry attempts
    /// run without one since their pacing comes from the backoff. An error
    /// returned by the owner is surfaced immediately, never retried.
    #[tracing::instrument(skip(self, request), fields(method = %request.method))]
    pub async fn call(&self, request: &RpcRequest) -> Result<Value, ProxyError> {
        let first = tokio::time::timeout(self.first_timeout, self.transport.call(request)).await;
        match first {
            Ok(outcome) => match self.classify(outcome)? {
                Some(value) => return Ok(value),
                None => debug!("first attempt hit unavailable transport"),
            },
            Err(_) => debug!(timeout_ms = self.first_timeout.as_millis() as u64, "first attempt timed out"),
        }

        let mut delay = self.backoff_base;
        for attempt in 1..=self.max_retries {
            tokio::time::sleep(delay).await;
            delay *= 2;

            match self.classify(self.transport.call(request).await)? {
                Some(value) => {
                    info!(attempt, "owner reachable after retry");
                    return Ok(value);
                }
                None => debug!(attempt, "retry found owner unavailable"),
            }
        }

        warn!(retries = self.max_retries, "owner unreachable, giving up");
        crate::metrics::record_operation("proxy", "call", "owner_unavailable");
        Err(ProxyError::OwnerUnavailable)
    }

    /// `Ok(Some)` on success, `Ok(None)` when the attempt should be retried.
    fn classify(
        &self,
        outcome: Result<RpcResponse, TransportError>,
    ) -> Result<Option<Value>, ProxyError> {
        match outcome {
            Ok(RpcResponse { error: Some(message), .. }) => Err(ProxyError::Remote(message)),
            Ok(RpcResponse { result, .. }) => Ok(Some(result.unwrap_or(Value::Null))),
            Err(TransportError::Unavailable) => Ok(None),
            Err(TransportError::Other(message)) => Err(ProxyError::Transport(message)),
        }
    }
}

/// Typed client for non-owner contexts.
///
/// Reads and queries fail with [`ProxyError::OwnerUnavailable`] when the
/// owner cannot be reached; writes instead fall back to the local FastStore
/// so the event survives until the owner comes back and merges it by
/// timestamp.
pub struct EngineClient {
    proxy: CallProxy,
    local_fast: Arc<dyn FastStore>,
}

impl EngineClient {
    pub fn new(proxy: CallProxy, local_fast: Arc<dyn FastStore>) -> Self {
        Self { proxy, local_fast }
    }

    pub async fn write_record(&self, record: &HistoryRecord) -> Result<(), ProxyError> {
        let arg = serde_json::to_value(record).map_err(|e| ProxyError::Codec(e.to_string()))?;
        match self.proxy.call(&RpcRequest::new("write_record", vec![arg.clone()])).await {
            Ok(_) => Ok(()),
            Err(ProxyError::OwnerUnavailable) => {
                warn!(id = %record.id(), "owner unavailable, writing record locally");
                self.local_fast
                    .set(&record.storage_key(), &arg)
                    .await
                    .map_err(|e: StorageError| ProxyError::Transport(e.to_string()))?;
                crate::metrics::record_operation("proxy", "write", "local_fallback");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_record(
        &self,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<HistoryRecord>, ProxyError> {
        let value = self
            .proxy
            .call(&RpcRequest::new("read_record", vec![json!(kind), json!(id)]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ProxyError::Codec(e.to_string()))
    }

    pub async fn remove_record(&self, kind: RecordKind, id: &str) -> Result<(), ProxyError> {
        self.proxy
            .call(&RpcRequest::new("remove_record", vec![json!(kind), json!(id)]))
            .await?;
        Ok(())
    }

    pub async fn query_history(
        &self,
        kind: RecordKind,
        request: &PageRequest,
    ) -> Result<HistoryPage, ProxyError> {
        let arg = serde_json::to_value(request).map_err(|e| ProxyError::Codec(e.to_string()))?;
        let value = self
            .proxy
            .call(&RpcRequest::new("query_history", vec![json!(kind), arg]))
            .await?;
        serde_json::from_value(value).map_err(|e| ProxyError::Codec(e.to_string()))
    }

    pub async fn update_stats(
        &self,
        delta_seconds: i64,
        when_millis: i64,
        update: &StatsUpdate,
    ) -> Result<(), ProxyError> {
        let update = serde_json::to_value(update).map_err(|e| ProxyError::Codec(e.to_string()))?;
        self.proxy
            .call(&RpcRequest::new(
                "update_stats",
                vec![json!(delta_seconds), json!(when_millis), update],
            ))
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<WatchStats, ProxyError> {
        let value = self.proxy.call(&RpcRequest::new("get_stats", vec![])).await?;
        serde_json::from_value(value).map_err(|e| ProxyError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VideoRecord;
    use crate::storage::memory::MemoryFastStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn video(id: &str) -> HistoryRecord {
        HistoryRecord::Video(VideoRecord {
            id: id.to_string(),
            timestamp: 1_700_000_000_000,
            time: 60,
            duration: 300,
            title: format!("Video {id}"),
            url: format!("https://example.com/watch?v={id}"),
            is_shorts: false,
            channel_name: None,
            channel_id: None,
        })
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            proxy_first_timeout_ms: 50,
            proxy_backoff_base_ms: 1,
            proxy_max_retries: 4,
            ..Default::default()
        }
    }

    /// Fails with `Unavailable` for the first `failures` calls, then answers.
    struct FlakyTransport {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl OwnerTransport for FlakyTransport {
        async fn call(&self, _request: &RpcRequest) -> Result<RpcResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(TransportError::Unavailable)
            } else {
                Ok(RpcResponse::ok(Value::Null))
            }
        }
    }

    struct DeadTransport;

    #[async_trait]
    impl OwnerTransport for DeadTransport {
        async fn call(&self, _request: &RpcRequest) -> Result<RpcResponse, TransportError> {
            Err(TransportError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let transport = Arc::new(FlakyTransport { calls: AtomicU32::new(0), failures: 3 });
        let proxy = CallProxy::new(&fast_config(), transport.clone());

        let result = proxy.call(&RpcRequest::new("read_record", vec![])).await;
        assert!(result.is_ok());
        // 1 first attempt + 3 failed retries... the third retry succeeds.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_owner_unavailable() {
        let proxy = CallProxy::new(&fast_config(), Arc::new(DeadTransport));
        let err = proxy.call(&RpcRequest::new("read_record", vec![])).await.unwrap_err();
        assert!(matches!(err, ProxyError::OwnerUnavailable));
    }

    #[tokio::test]
    async fn test_remote_error_not_retried() {
        struct ErrTransport(AtomicU32);

        #[async_trait]
        impl OwnerTransport for ErrTransport {
            async fn call(&self, _request: &RpcRequest) -> Result<RpcResponse, TransportError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(RpcResponse::err("no such method"))
            }
        }

        let transport = Arc::new(ErrTransport(AtomicU32::new(0)));
        let proxy = CallProxy::new(&fast_config(), transport.clone());

        let err = proxy.call(&RpcRequest::new("bogus", vec![])).await.unwrap_err();
        assert!(matches!(err, ProxyError::Remote(_)));
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_falls_back_to_local_store() {
        let local = Arc::new(MemoryFastStore::new());
        let client = EngineClient::new(
            CallProxy::new(&fast_config(), Arc::new(DeadTransport)),
            local.clone(),
        );

        let rec = video("a");
        client.write_record(&rec).await.unwrap();

        // The record landed locally and will merge by timestamp later.
        let stored = local.get(&rec.storage_key()).await.unwrap().unwrap();
        let stored: HistoryRecord = serde_json::from_value(stored).unwrap();
        assert_eq!(stored, rec);
    }

    #[tokio::test]
    async fn test_read_has_no_local_fallback() {
        let client = EngineClient::new(
            CallProxy::new(&fast_config(), Arc::new(DeadTransport)),
            Arc::new(MemoryFastStore::new()),
        );
        let err = client.read_record(RecordKind::Video, "a").await.unwrap_err();
        assert!(matches!(err, ProxyError::OwnerUnavailable));
    }

    #[tokio::test]
    async fn test_first_attempt_timeout_counts_as_unavailable() {
        struct SlowThenOk(AtomicU32);

        #[async_trait]
        impl OwnerTransport for SlowThenOk {
            async fn call(&self, _request: &RpcRequest) -> Result<RpcResponse, TransportError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(RpcResponse::ok(json!("late")))
            }
        }

        let proxy = CallProxy::new(&fast_config(), Arc::new(SlowThenOk(AtomicU32::new(0))));
        let value = proxy.call(&RpcRequest::new("read_record", vec![])).await.unwrap();
        assert_eq!(value, json!("late"));
    }
}
