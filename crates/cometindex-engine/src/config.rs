//! Serializable settings for the live pipeline and the backfiller.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cometindex_core::error::IndexerError;
use cometindex_core::retry::RetryConfig;
use cometindex_rpc::HttpClientConfig;

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_drain_interval_ms() -> u64 {
    100
}

fn default_destroy_delay_ms() -> u64 {
    3_000
}

fn default_num_workers() -> usize {
    4
}

fn default_should_persist() -> bool {
    true
}

// ─── Live indexing ────────────────────────────────────────────────────────────

/// Where new-block notifications come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// Push notifications over `/websocket`; block data over HTTP.
    WebSocket { ws_url: String, http_url: String },
    /// Poll `status` for the latest height.
    HttpPoll {
        http_url: String,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        /// First height to index; defaults to the chain tip at connect time.
        #[serde(default)]
        start_height: Option<u64>,
    },
}

impl EndpointConfig {
    pub fn websocket(ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        Self::WebSocket {
            ws_url: ws_url.into(),
            http_url: http_url.into(),
        }
    }

    pub fn http_poll(http_url: impl Into<String>) -> Self {
        Self::HttpPoll {
            http_url: http_url.into(),
            poll_interval_ms: default_poll_interval_ms(),
            start_height: None,
        }
    }

    /// The URL block data is fetched from.
    pub fn http_url(&self) -> &str {
        match self {
            Self::WebSocket { http_url, .. } | Self::HttpPoll { http_url, .. } => http_url,
        }
    }
}

/// Timing of the pipeline's drain task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Longest the drain task sleeps when nothing is queued.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Grace period for an in-flight block during `destroy`.
    #[serde(default = "default_destroy_delay_ms")]
    pub destroy_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval_ms(),
            destroy_delay_ms: default_destroy_delay_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn destroy_delay(&self) -> Duration {
        Duration::from_millis(self.destroy_delay_ms)
    }
}

/// Everything needed to assemble a live [`crate::IndexingPipeline`] except the indexers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub http: HttpClientConfig,
    /// Reconnect policy of the live connection.
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// ─── Backfill ─────────────────────────────────────────────────────────────────

/// How a backfill walks its heights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillOrder {
    /// Unprocessed ranges, lowest first.
    #[default]
    Ascending,
    /// Unprocessed ranges, highest first.
    Descending,
    /// Unprocessed ranges split across `num_workers`.
    Concurrent,
    /// `heights` in list order.
    Specific,
    /// `heights`, up to `num_workers` at a time.
    ConcurrentSpecific,
}

/// Backfill settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub order: BackfillOrder,
    pub http_url: String,
    #[serde(default)]
    pub http: HttpClientConfig,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Heights for the `specific` orders.
    #[serde(default)]
    pub heights: Vec<u64>,
    /// Record the `specific` heights as processed.
    #[serde(default = "default_should_persist")]
    pub should_persist: bool,
}

impl BackfillConfig {
    pub fn new(http_url: impl Into<String>) -> Self {
        Self {
            order: BackfillOrder::default(),
            http_url: http_url.into(),
            http: HttpClientConfig::default(),
            num_workers: default_num_workers(),
            heights: Vec::new(),
            should_persist: default_should_persist(),
        }
    }

    /// Resolve the order and its parameters into a [`BackfillStrategy`].
    pub fn strategy(&self) -> Result<BackfillStrategy, IndexerError> {
        let concurrent = matches!(
            self.order,
            BackfillOrder::Concurrent | BackfillOrder::ConcurrentSpecific
        );
        if concurrent && self.num_workers == 0 {
            return Err(IndexerError::Config(
                "num_workers must be at least 1 for a concurrent backfill".into(),
            ));
        }

        Ok(match self.order {
            BackfillOrder::Ascending => BackfillStrategy::Ascending,
            BackfillOrder::Descending => BackfillStrategy::Descending,
            BackfillOrder::Concurrent => BackfillStrategy::Concurrent {
                num_workers: self.num_workers,
            },
            BackfillOrder::Specific => BackfillStrategy::Specific {
                heights: self.heights.clone(),
                should_persist: self.should_persist,
            },
            BackfillOrder::ConcurrentSpecific => BackfillStrategy::ConcurrentSpecific {
                heights: self.heights.clone(),
                should_persist: self.should_persist,
                num_workers: self.num_workers,
            },
        })
    }
}

/// A backfill order together with the parameters it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillStrategy {
    Ascending,
    Descending,
    Concurrent {
        num_workers: usize,
    },
    Specific {
        heights: Vec<u64>,
        should_persist: bool,
    },
    ConcurrentSpecific {
        heights: Vec<u64>,
        should_persist: bool,
        num_workers: usize,
    },
}

impl BackfillStrategy {
    pub fn order(&self) -> BackfillOrder {
        match self {
            Self::Ascending => BackfillOrder::Ascending,
            Self::Descending => BackfillOrder::Descending,
            Self::Concurrent { .. } => BackfillOrder::Concurrent,
            Self::Specific { .. } => BackfillOrder::Specific,
            Self::ConcurrentSpecific { .. } => BackfillOrder::ConcurrentSpecific,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_json() {
        let ws: EndpointConfig = serde_json::from_str(
            r#"{"type":"web_socket","ws_url":"ws://localhost:26657/websocket","http_url":"http://localhost:26657"}"#,
        )
        .unwrap();
        assert_eq!(ws.http_url(), "http://localhost:26657");

        let poll: EndpointConfig =
            serde_json::from_str(r#"{"type":"http_poll","http_url":"http://node:26657"}"#).unwrap();
        assert_eq!(poll, EndpointConfig::http_poll("http://node:26657"));
    }

    #[test]
    fn live_config_defaults() {
        let cfg: LiveConfig = serde_json::from_str(
            r#"{"endpoint":{"type":"http_poll","http_url":"http://node:26657","start_height":42}}"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline, PipelineConfig::default());
        assert_eq!(cfg.pipeline.drain_interval(), Duration::from_millis(100));
        assert_eq!(cfg.pipeline.destroy_delay(), Duration::from_secs(3));
        assert!(matches!(
            cfg.endpoint,
            EndpointConfig::HttpPoll {
                poll_interval_ms: 2_000,
                start_height: Some(42),
                ..
            }
        ));
    }

    #[test]
    fn backfill_strategy_resolution() {
        let mut cfg: BackfillConfig = serde_json::from_str(
            r#"{"order":"concurrent_specific","http_url":"http://archive:26657","heights":[3,1,2]}"#,
        )
        .unwrap();
        assert!(cfg.should_persist);
        assert_eq!(
            cfg.strategy().unwrap(),
            BackfillStrategy::ConcurrentSpecific {
                heights: vec![3, 1, 2],
                should_persist: true,
                num_workers: 4,
            }
        );

        cfg.num_workers = 0;
        assert!(matches!(cfg.strategy(), Err(IndexerError::Config(_))));

        cfg.order = BackfillOrder::Descending;
        assert_eq!(cfg.strategy().unwrap(), BackfillStrategy::Descending);
    }
}
