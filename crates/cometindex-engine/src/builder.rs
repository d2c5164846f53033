//! Fluent builders that assemble a live pipeline or a backfiller.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cometindex_core::Indexer;
//! use cometindex_engine::IndexerHarnessBuilder;
//!
//! # async fn example(indexer: Arc<dyn Indexer>) -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = IndexerHarnessBuilder::new()
//!     .websocket("wss://rpc.cosmos.network/websocket", "https://rpc.cosmos.network")
//!     .indexer(indexer)
//!     .build()?;
//! pipeline.start().await?;
//! pipeline.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use cometindex_core::error::IndexerError;
use cometindex_core::indexer::{Indexer, PersistentIndexer, RegisteredIndexer};
use cometindex_core::retry::RetryConfig;
use cometindex_core::source::BlockSource;
use cometindex_rpc::{CometHttpClient, HttpClientConfig, HttpPollTransport, Transport, WsTransport};

use crate::backfill::Backfiller;
use crate::config::{BackfillConfig, BackfillOrder, EndpointConfig, LiveConfig, PipelineConfig};
use crate::pipeline::IndexingPipeline;

fn http_source(url: &str, config: &HttpClientConfig) -> Result<Arc<dyn BlockSource>, IndexerError> {
    Ok(Arc::new(CometHttpClient::new(url, config)?))
}

/// Fluent builder for [`IndexingPipeline`].
#[derive(Default)]
pub struct IndexerHarnessBuilder {
    endpoint: Option<EndpointConfig>,
    http: HttpClientConfig,
    retry: RetryConfig,
    pipeline: PipelineConfig,
    indexers: Vec<RegisteredIndexer>,
    source: Option<Arc<dyn BlockSource>>,
}

impl IndexerHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a deserialized [`LiveConfig`].
    pub fn from_config(config: LiveConfig) -> Self {
        Self {
            endpoint: Some(config.endpoint),
            http: config.http,
            retry: config.retry,
            pipeline: config.pipeline,
            ..Self::default()
        }
    }

    /// Listen for new blocks over WebSocket.
    pub fn websocket(mut self, ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        self.endpoint = Some(EndpointConfig::websocket(ws_url, http_url));
        self
    }

    /// Poll the node for new blocks.
    pub fn http_poll(mut self, http_url: impl Into<String>) -> Self {
        self.endpoint = Some(EndpointConfig::http_poll(http_url));
        self
    }

    /// Poll interval. Only meaningful with [`IndexerHarnessBuilder::http_poll`].
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        if let Some(EndpointConfig::HttpPoll {
            poll_interval_ms, ..
        }) = &mut self.endpoint
        {
            *poll_interval_ms = ms;
        }
        self
    }

    /// First height to index. Only meaningful with [`IndexerHarnessBuilder::http_poll`].
    pub fn start_height(mut self, height: u64) -> Self {
        if let Some(EndpointConfig::HttpPoll { start_height, .. }) = &mut self.endpoint {
            *start_height = Some(height);
        }
        self
    }

    /// Retry policy for the live connection and every block fetch.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.http.retry = retry.clone();
        self.retry = retry;
        self
    }

    pub fn http_config(mut self, http: HttpClientConfig) -> Self {
        self.http = http;
        self
    }

    pub fn drain_interval_ms(mut self, ms: u64) -> Self {
        self.pipeline.drain_interval_ms = ms;
        self
    }

    pub fn destroy_delay_ms(mut self, ms: u64) -> Self {
        self.pipeline.destroy_delay_ms = ms;
        self
    }

    /// Register an indexer without persistence.
    pub fn indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexers.push(RegisteredIndexer::plain(indexer));
        self
    }

    /// Register an indexer that records processed heights.
    pub fn persistent_indexer(mut self, indexer: Arc<dyn PersistentIndexer>) -> Self {
        self.indexers.push(RegisteredIndexer::persistent(indexer));
        self
    }

    /// Fetch block data from `source` instead of the endpoint's HTTP URL.
    pub fn block_source(mut self, source: Arc<dyn BlockSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// The serializable part of the configuration.
    pub fn build_config(&self) -> Result<LiveConfig, IndexerError> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| IndexerError::Config("no endpoint configured".into()))?;
        Ok(LiveConfig {
            endpoint,
            http: self.http.clone(),
            retry: self.retry.clone(),
            pipeline: self.pipeline.clone(),
        })
    }

    pub fn build(self) -> Result<IndexingPipeline, IndexerError> {
        let config = self.build_config()?;
        if self.indexers.is_empty() {
            return Err(IndexerError::Config("at least one indexer is required".into()));
        }

        let source = match self.source {
            Some(source) => source,
            None => http_source(config.endpoint.http_url(), &config.http)?,
        };

        let transport: Box<dyn Transport> = match &config.endpoint {
            EndpointConfig::WebSocket { ws_url, .. } => Box::new(WsTransport::new(ws_url.clone())),
            EndpointConfig::HttpPoll {
                poll_interval_ms,
                start_height,
                ..
            } => {
                let poll = HttpPollTransport::new(source.clone())
                    .with_poll_interval(Duration::from_millis(*poll_interval_ms));
                Box::new(match start_height {
                    Some(h) => poll.with_start_height(*h),
                    None => poll,
                })
            }
        };

        Ok(IndexingPipeline::new(
            transport,
            config.retry.build(),
            source,
            self.indexers,
            config.pipeline,
        ))
    }
}

/// Fluent builder for [`Backfiller`].
pub struct BackfillHarnessBuilder {
    config: BackfillConfig,
    indexer: Option<Arc<dyn PersistentIndexer>>,
    source: Option<Arc<dyn BlockSource>>,
}

impl Default for BackfillHarnessBuilder {
    fn default() -> Self {
        Self {
            config: BackfillConfig::new(""),
            indexer: None,
            source: None,
        }
    }
}

impl BackfillHarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: BackfillConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Archive node to fetch historical blocks from.
    pub fn http_url(mut self, url: impl Into<String>) -> Self {
        self.config.http_url = url.into();
        self
    }

    pub fn order(mut self, order: BackfillOrder) -> Self {
        self.config.order = order;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    /// Heights for the specific orders.
    pub fn heights(mut self, heights: impl IntoIterator<Item = u64>) -> Self {
        self.config.heights = heights.into_iter().collect();
        self
    }

    pub fn should_persist(mut self, persist: bool) -> Self {
        self.config.should_persist = persist;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.http.retry = retry;
        self
    }

    pub fn indexer(mut self, indexer: Arc<dyn PersistentIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn block_source(mut self, source: Arc<dyn BlockSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build_config(&self) -> BackfillConfig {
        self.config.clone()
    }

    pub fn build(self) -> Result<Backfiller, IndexerError> {
        let strategy = self.config.strategy()?;
        let indexer = self
            .indexer
            .ok_or_else(|| IndexerError::Config("no indexer configured".into()))?;
        let source = match self.source {
            Some(source) => source,
            None if self.config.http_url.is_empty() => {
                return Err(IndexerError::Config("no archive node URL configured".into()))
            }
            None => http_source(&self.config.http_url, &self.config.http)?,
        };
        Ok(Backfiller::new(indexer, source, strategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cometindex_core::retry::BackoffConfig;

    use crate::config::BackfillStrategy;
    use crate::testing::{block_source, Log, RecordingIndexer};

    #[test]
    fn live_builder_defaults() {
        let config = IndexerHarnessBuilder::new()
            .http_poll("http://localhost:26657")
            .build_config()
            .unwrap();
        assert_eq!(config.endpoint, EndpointConfig::http_poll("http://localhost:26657"));
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn live_builder_custom() {
        let retry = RetryConfig {
            max_retries: Some(5),
            backoff: BackoffConfig::Fixed { interval_ms: 250 },
        };
        let config = IndexerHarnessBuilder::new()
            .http_poll("http://localhost:26657")
            .poll_interval_ms(500)
            .start_height(1_000)
            .retry(retry.clone())
            .drain_interval_ms(10)
            .destroy_delay_ms(0)
            .build_config()
            .unwrap();

        assert_eq!(
            config.endpoint,
            EndpointConfig::HttpPoll {
                http_url: "http://localhost:26657".into(),
                poll_interval_ms: 500,
                start_height: Some(1_000),
            }
        );
        assert_eq!(config.retry, retry);
        assert_eq!(config.http.retry, retry);
        assert_eq!(config.pipeline.drain_interval_ms, 10);
        assert_eq!(config.pipeline.destroy_delay_ms, 0);
    }

    #[test]
    fn live_builder_requires_endpoint_and_indexer() {
        assert!(matches!(
            IndexerHarnessBuilder::new().build(),
            Err(IndexerError::Config(_))
        ));
        assert!(matches!(
            IndexerHarnessBuilder::new()
                .websocket("ws://localhost:26657/websocket", "http://localhost:26657")
                .build(),
            Err(IndexerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn live_builder_builds_pipeline() {
        let log = Log::default();
        let pipeline = IndexerHarnessBuilder::new()
            .websocket("ws://127.0.0.1:1/websocket", "http://127.0.0.1:1")
            .indexer(Arc::new(RecordingIndexer::new("a", &log)))
            .persistent_indexer(Arc::new(RecordingIndexer::new("b", &log)))
            .block_source(block_source())
            .destroy_delay_ms(0)
            .build()
            .unwrap();

        assert!(!pipeline.is_connected());
        assert_eq!(pipeline.client().transport_name(), "websocket");
        pipeline.destroy().await.unwrap();
        assert_eq!(log.entries().len(), 2);
    }

    #[tokio::test]
    async fn backfill_builder() {
        let log = Log::default();
        let builder = BackfillHarnessBuilder::new()
            .http_url("http://archive:26657")
            .order(BackfillOrder::Specific)
            .heights([7, 3])
            .should_persist(false);
        assert_eq!(builder.build_config().heights, vec![7, 3]);

        let backfiller = builder
            .indexer(Arc::new(RecordingIndexer::new("a", &log)))
            .build()
            .unwrap();
        assert_eq!(
            backfiller.strategy(),
            &BackfillStrategy::Specific {
                heights: vec![7, 3],
                should_persist: false,
            }
        );
    }

    #[tokio::test]
    async fn backfill_builder_rejects_incomplete_setup() {
        let log = Log::default();
        assert!(matches!(
            BackfillHarnessBuilder::new().http_url("http://archive:26657").build(),
            Err(IndexerError::Config(_))
        ));
        assert!(matches!(
            BackfillHarnessBuilder::new()
                .indexer(Arc::new(RecordingIndexer::new("a", &log)))
                .build(),
            Err(IndexerError::Config(_))
        ));
        assert!(matches!(
            BackfillHarnessBuilder::new()
                .http_url("http://archive:26657")
                .order(BackfillOrder::Concurrent)
                .num_workers(0)
                .indexer(Arc::new(RecordingIndexer::new("a", &log)))
                .build(),
            Err(IndexerError::Config(_))
        ));
    }
}
