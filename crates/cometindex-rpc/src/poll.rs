//! HTTP polling transport for nodes without a usable WebSocket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cometindex_core::source::BlockSource;

use crate::connection::{BlockEmitter, Transport};
use crate::error::TransportError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Polls the node's latest height and emits every height past the last one seen.
pub struct HttpPollTransport {
    source: Arc<dyn BlockSource>,
    poll_interval: Duration,
    start_height: Option<u64>,
}

impl std::fmt::Debug for HttpPollTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPollTransport")
            .field("poll_interval", &self.poll_interval)
            .field("start_height", &self.start_height)
            .finish()
    }
}

impl HttpPollTransport {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self {
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_height: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// First height to emit. Without it polling starts after the current tip.
    pub fn with_start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }
}

#[async_trait]
impl Transport for HttpPollTransport {
    fn name(&self) -> &str {
        "http-poll"
    }

    async fn connect(&self, resume_from: Option<u64>) -> Result<Option<u64>, TransportError> {
        let heights = self.source.block_heights().await?;

        if let Some(last) = resume_from {
            // the node must still serve the next height we need
            let next = last.saturating_add(1);
            if heights.earliest > next {
                return Err(TransportError::InvalidStartHeight {
                    start: next,
                    earliest: heights.earliest,
                    latest: heights.latest,
                });
            }
            return Ok(Some(last));
        }

        match self.start_height {
            Some(start) if start < heights.earliest || start > heights.latest => {
                Err(TransportError::InvalidStartHeight {
                    start,
                    earliest: heights.earliest,
                    latest: heights.latest,
                })
            }
            Some(start) => Ok(Some(start.saturating_sub(1))),
            None => Ok(Some(heights.latest)),
        }
    }

    async fn listen_once(&self, blocks: &BlockEmitter<'_>) -> Result<(), TransportError> {
        loop {
            let latest = self.source.block_heights().await?.latest;
            let next = blocks.height().map_or(latest, |h| h.saturating_add(1));
            if next <= latest {
                tracing::debug!(from = next, to = latest, "polled new blocks");
                for height in next..=latest {
                    blocks.emit(height);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
