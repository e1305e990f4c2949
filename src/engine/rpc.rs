//! Owner-side dispatch of forwarded calls.
//!
//! The counterpart of [`CallProxy`](crate::proxy::CallProxy): a transport
//! delivers [`RpcRequest`]s here and ships the [`RpcResponse`] back. Unknown
//! methods and malformed arguments are answered with an error envelope, never
//! a panic; a proxy bug must not take the owner down.

use serde_json::{json, Value};
use tracing::debug;

use crate::proxy::{RpcRequest, RpcResponse};
use crate::record::RecordKind;

use super::{HistoryEngine, PageRequest};

impl HistoryEngine {
    /// Execute one forwarded operation.
    #[tracing::instrument(skip(self, request), fields(method = %request.method))]
    pub async fn handle_rpc(&self, request: RpcRequest) -> RpcResponse {
        debug!(args = request.args.len(), "handling forwarded call");
        match self.dispatch(&request).await {
            Ok(result) => RpcResponse::ok(result),
            Err(message) => RpcResponse::err(message),
        }
    }

    async fn dispatch(&self, request: &RpcRequest) -> Result<Value, String> {
        match request.method.as_str() {
            "write_record" => {
                let record = arg(request, 0)?;
                self.write_record(&record).await.map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            "read_record" => {
                let kind: RecordKind = arg(request, 0)?;
                let id: String = arg(request, 1)?;
                let record = self.read_record(kind, &id).await.map_err(|e| e.to_string())?;
                Ok(record.map_or(Value::Null, |r| json!(r)))
            }
            "remove_record" => {
                let kind: RecordKind = arg(request, 0)?;
                let id: String = arg(request, 1)?;
                self.remove_record(kind, &id).await.map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            "query_history" => {
                let kind: RecordKind = arg(request, 0)?;
                let page: PageRequest = arg(request, 1)?;
                let result = self.query_history(kind, &page).await.map_err(|e| e.to_string())?;
                serde_json::to_value(result).map_err(|e| e.to_string())
            }
            "update_stats" => {
                let delta: i64 = arg(request, 0)?;
                let when: i64 = arg(request, 1)?;
                let update = arg(request, 2)?;
                self.update_stats(delta, when, &update)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            "get_stats" => {
                let stats = self.stats().await.map_err(|e| e.to_string())?;
                serde_json::to_value(stats).map_err(|e| e.to_string())
            }
            other => Err(format!("unknown method '{other}'")),
        }
    }
}

fn arg<T: serde::de::DeserializeOwned>(request: &RpcRequest, index: usize) -> Result<T, String> {
    let value = request
        .args
        .get(index)
        .ok_or_else(|| format!("missing argument {index} for '{}'", request.method))?;
    serde_json::from_value(value.clone())
        .map_err(|e| format!("bad argument {index} for '{}': {e}", request.method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::record::{now_millis, HistoryRecord, VideoRecord};
    use crate::storage::memory::MemoryFastStore;
    use std::sync::Arc;

    fn video(id: &str) -> HistoryRecord {
        HistoryRecord::Video(VideoRecord {
            id: id.to_string(),
            timestamp: now_millis(),
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

    #[tokio::test]
    async fn test_write_read_round_trip_over_rpc() {
        let engine = engine();
        let rec = video("a");

        let response = engine
            .handle_rpc(RpcRequest::new("write_record", vec![json!(rec)]))
            .await;
        assert!(response.error.is_none());

        let response = engine
            .handle_rpc(RpcRequest::new("read_record", vec![json!("video"), json!("a")]))
            .await;
        let got: HistoryRecord = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(got, rec);
    }

    #[tokio::test]
    async fn test_unknown_method_answers_error_envelope() {
        let response = engine().handle_rpc(RpcRequest::new("bogus", vec![])).await;
        assert!(response.result.is_none());
        assert!(response.error.unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn test_malformed_argument_answers_error_envelope() {
        let response = engine()
            .handle_rpc(RpcRequest::new("read_record", vec![json!(42), json!("a")]))
            .await;
        assert!(response.error.unwrap().contains("bad argument 0"));
    }

    #[tokio::test]
    async fn test_missing_argument_answers_error_envelope() {
        let response = engine()
            .handle_rpc(RpcRequest::new("read_record", vec![json!("video")]))
            .await;
        assert!(response.error.unwrap().contains("missing argument 1"));
    }
}
