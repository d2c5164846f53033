//! CometBFT HTTP JSON-RPC client backed by `reqwest`.
//!
//! Every public call goes through an [`ErrorRetrier`], so a flaky node is
//! retried with backoff before the caller ever sees an error. `block` and
//! `block_results` can optionally travel in one HTTP batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cometindex_core::error::IndexerError;
use cometindex_core::retry::{ErrorRetrier, Retrier, RetryConfig, RetryHooks};
use cometindex_core::source::BlockSource;
use cometindex_core::types::{BlockData, BlockHeights, RawTmEvent, TmEvent};

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId};

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Configuration for [`CometHttpClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Fetch `block` and `block_results` in a single batched POST.
    #[serde(default)]
    pub batch_requests: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            batch_requests: false,
            retry: RetryConfig::default(),
        }
    }
}

/// HTTP client for a single CometBFT RPC endpoint.
pub struct CometHttpClient {
    url: String,
    http: reqwest::Client,
    retrier: ErrorRetrier,
    batch_requests: bool,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CometHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CometHttpClient")
            .field("url", &self.url)
            .field("batch_requests", &self.batch_requests)
            .finish()
    }
}

impl CometHttpClient {
    pub fn new(url: impl Into<String>, config: &HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            retrier: ErrorRetrier::new(config.retry.build()),
            batch_requests: config.batch_requests,
            next_id: AtomicU64::new(1),
        })
    }

    /// Default settings: 30s timeout, no batching, unbounded exponential retry.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, &HttpClientConfig::default())
    }

    /// Replace the retry policy.
    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = ErrorRetrier::new(retrier);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, method: &str, params: Value) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        JsonRpcRequest::new(id, method, params)
    }

    async fn post<B: Serialize + ?Sized, R: serde::de::DeserializeOwned>(
        &self,
        body: &B,
    ) -> Result<R, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<R>()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    /// One JSON-RPC call, no retry.
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let req = self.request(method, params);
        let resp: JsonRpcResponse = self.post(&req).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }

    /// Several calls in one POST. Results come back in request order.
    async fn call_batch(&self, calls: &[(&str, Value)]) -> Result<Vec<Value>, TransportError> {
        let reqs: Vec<JsonRpcRequest> = calls
            .iter()
            .map(|(method, params)| self.request(method, params.clone()))
            .collect();
        let resps: Vec<JsonRpcResponse> = self.post(&reqs).await?;
        match_batch(&reqs, resps)
    }

    async fn fetch_block_pair(&self, height: u64) -> Result<(Value, Value), TransportError> {
        let params = json!({ "height": height.to_string() });
        if self.batch_requests {
            let mut results = self
                .call_batch(&[("block", params.clone()), ("block_results", params)])
                .await?
                .into_iter();
            match (results.next(), results.next()) {
                (Some(block), Some(block_results)) => Ok((block, block_results)),
                _ => Err(TransportError::Protocol("short batch response".into())),
            }
        } else {
            let block = self.call("block", params.clone()).await?;
            let block_results = self.call("block_results", params).await?;
            Ok((block, block_results))
        }
    }

    /// Raw `status` result.
    pub async fn status(&self) -> Result<Value, TransportError> {
        self.retrier
            .wrap(|| self.call("status", json!({})), RetryHooks::logged("status"))
            .await
    }

    /// Earliest and latest heights served by the node.
    pub async fn block_heights(&self) -> Result<BlockHeights, TransportError> {
        self.retrier
            .wrap(
                || async { parse_block_heights(&self.call("status", json!({})).await?) },
                RetryHooks::logged("block_heights"),
            )
            .await
    }

    /// Block, results, and flattened events for `height`.
    pub async fn block_data(&self, height: u64) -> Result<BlockData, TransportError> {
        self.retrier
            .wrap(
                || async {
                    let (block, block_results) = self.fetch_block_pair(height).await?;
                    parse_block_data(height, &block, block_results)
                },
                RetryHooks::logged(format!("block_data({height})")),
            )
            .await
    }

    /// Header timestamp of the block at `height`.
    pub async fn block_time(&self, height: u64) -> Result<DateTime<Utc>, TransportError> {
        self.retrier
            .wrap(
                || async {
                    let block = self
                        .call("block", json!({ "height": height.to_string() }))
                        .await?;
                    parse_block_time(&block)
                },
                RetryHooks::logged(format!("block_time({height})")),
            )
            .await
    }
}

#[async_trait]
impl BlockSource for CometHttpClient {
    async fn block_data(&self, height: u64) -> Result<BlockData, IndexerError> {
        Ok(CometHttpClient::block_data(self, height).await?)
    }

    async fn block_heights(&self) -> Result<BlockHeights, IndexerError> {
        Ok(CometHttpClient::block_heights(self).await?)
    }
}

// ─── Response parsing ─────────────────────────────────────────────────────────

fn match_batch(
    reqs: &[JsonRpcRequest],
    resps: Vec<JsonRpcResponse>,
) -> Result<Vec<Value>, TransportError> {
    let mut by_id: Vec<(RpcId, JsonRpcResponse)> =
        resps.into_iter().map(|r| (r.id.clone(), r)).collect();

    reqs.iter()
        .map(|req| {
            let pos = by_id
                .iter()
                .position(|(id, _)| *id == req.id)
                .ok_or_else(|| {
                    TransportError::Protocol(format!("missing batch response for id {}", req.id))
                })?;
            let (_, resp) = by_id.swap_remove(pos);
            resp.into_result().map_err(TransportError::Rpc)
        })
        .collect()
}

/// Heights are strings on the wire but tolerate plain numbers.
pub(crate) fn parse_height(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Read `sync_info` from a `status` result. An earliest height of 0 or a
/// missing one means the node keeps everything from height 1.
pub fn parse_block_heights(status: &Value) -> Result<BlockHeights, TransportError> {
    let sync = status
        .get("sync_info")
        .ok_or_else(|| TransportError::Protocol("status without sync_info".into()))?;

    let latest = sync
        .get("latest_block_height")
        .and_then(parse_height)
        .ok_or_else(|| TransportError::Protocol("status without latest_block_height".into()))?;

    let earliest = sync
        .get("earliest_block_height")
        .and_then(parse_height)
        .filter(|h| *h > 0)
        .unwrap_or(1);

    Ok(BlockHeights { earliest, latest })
}

/// Combine `block` and `block_results` results into a [`BlockData`].
pub fn parse_block_data(
    height: u64,
    block: &Value,
    block_results: Value,
) -> Result<BlockData, TransportError> {
    let inner = block
        .get("block")
        .filter(|b| !b.is_null())
        .cloned()
        .ok_or_else(|| TransportError::Protocol(format!("block {height} missing from response")))?;

    let txs: Vec<Value> = block_results
        .get("txs_results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let events = flatten_tx_events(&txs)?;

    Ok(BlockData {
        height,
        block: inner,
        block_results,
        txs,
        events,
    })
}

/// Every event of every transaction, transactions first, events within in order.
pub fn flatten_tx_events(txs: &[Value]) -> Result<Vec<TmEvent>, TransportError> {
    let mut events = Vec::new();
    for tx in txs {
        let Some(raw) = tx.get("events").filter(|e| !e.is_null()) else {
            continue;
        };
        let raw: Vec<RawTmEvent> = serde_json::from_value(raw.clone())?;
        events.extend(raw.into_iter().map(TmEvent::from));
    }
    Ok(events)
}

/// `block.header.time` as UTC.
pub fn parse_block_time(block: &Value) -> Result<DateTime<Utc>, TransportError> {
    let raw = block
        .pointer("/block/header/time")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::Protocol("block without header time".into()))?;

    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TransportError::Protocol(format!("bad block time {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn block_fixture() -> Value {
        json!({
            "block_id": { "hash": "ABCD" },
            "block": {
                "header": {
                    "chain_id": "testchain-1",
                    "height": "42",
                    "time": "2024-03-01T12:30:45.123456789Z"
                },
                "data": { "txs": ["dHgx", "dHgy"] }
            }
        })
    }

    fn results_fixture() -> Value {
        json!({
            "height": "42",
            "txs_results": [
                {
                    "code": 0,
                    "events": [
                        { "type": "message", "attributes": [
                            { "key": "action", "value": "send", "index": true },
                            { "key": "sender", "value": "cosmos1a" }
                        ] },
                        { "type": "transfer", "attributes": [
                            { "key": "amount", "value": "1uatom" },
                            { "key": "amount", "value": "2uatom" }
                        ] }
                    ]
                },
                { "code": 5, "events": null },
                { "code": 0, "events": [ { "type": "delegate" } ] }
            ]
        })
    }

    #[test]
    fn heights_from_status() {
        let status = json!({
            "node_info": { "network": "testchain-1" },
            "sync_info": { "latest_block_height": "1200", "earliest_block_height": "300" }
        });
        assert_eq!(
            parse_block_heights(&status).unwrap(),
            BlockHeights { earliest: 300, latest: 1200 }
        );
    }

    #[test]
    fn zero_earliest_means_genesis() {
        let status = json!({ "sync_info": { "latest_block_height": "9", "earliest_block_height": "0" } });
        assert_eq!(parse_block_heights(&status).unwrap().earliest, 1);

        let status = json!({ "sync_info": { "latest_block_height": 9 } });
        assert_eq!(parse_block_heights(&status).unwrap(), BlockHeights { earliest: 1, latest: 9 });
    }

    #[test]
    fn status_without_latest_is_rejected() {
        let status = json!({ "sync_info": {} });
        assert!(matches!(
            parse_block_heights(&status),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn events_flattened_in_tx_order() {
        let data = parse_block_data(42, &block_fixture(), results_fixture()).unwrap();

        assert_eq!(data.height, 42);
        assert_eq!(data.txs.len(), 3);
        assert_eq!(data.block["header"]["chain_id"], "testchain-1");

        let kinds: Vec<&str> = data.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, ["message", "transfer", "delegate"]);
        assert_eq!(data.events[0].attributes["action"], "send");
        assert_eq!(data.events[1].attributes["amount"], "2uatom");
        assert!(data.events[2].attributes.is_empty());
    }

    #[test]
    fn empty_block_has_no_events() {
        let data = parse_block_data(7, &block_fixture(), json!({ "height": "7", "txs_results": null }))
            .unwrap();
        assert!(data.txs.is_empty());
        assert!(data.events.is_empty());
    }

    #[test]
    fn missing_block_is_protocol_error() {
        let err = parse_block_data(7, &json!({ "block": null }), json!({})).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn block_time_is_utc() {
        let t = parse_block_time(&block_fixture()).unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2024, 3, 1));
        assert_eq!((t.hour(), t.minute(), t.second()), (12, 30, 45));
    }

    #[test]
    fn batch_responses_matched_by_id() {
        let reqs = vec![
            JsonRpcRequest::new(10, "block", json!({})),
            JsonRpcRequest::new(11, "block_results", json!({})),
        ];
        let resps: Vec<JsonRpcResponse> = serde_json::from_value(json!([
            { "jsonrpc": "2.0", "id": 11, "result": "results" },
            { "jsonrpc": "2.0", "id": 10, "result": "block" }
        ]))
        .unwrap();

        assert_eq!(
            match_batch(&reqs, resps).unwrap(),
            vec![json!("block"), json!("results")]
        );
    }

    #[test]
    fn batch_missing_response_is_protocol_error() {
        let reqs = vec![JsonRpcRequest::new(1, "block", json!({}))];
        assert!(matches!(
            match_batch(&reqs, vec![]),
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_node_exhausts_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = CometHttpClient::default_for(format!("http://{addr}"))
            .unwrap()
            .with_retrier(Retrier::fixed(Duration::from_millis(1), Some(2)));

        let err = client.block_heights().await.unwrap_err();
        assert!(matches!(err, TransportError::Http(_)));
    }
}
