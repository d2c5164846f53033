//! Recording fakes shared by the pipeline and backfill tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use cometindex_core::error::IndexerError;
use cometindex_core::indexer::{Indexer, PersistentIndexer};
use cometindex_core::persister::Persister;
use cometindex_core::source::BlockSource;
use cometindex_core::subscription::{BlockHandler, BlockView, Subscription};
use cometindex_core::types::{BlockData, BlockHeights, BlockRange};

#[derive(Clone, Default)]
pub(crate) struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub(crate) fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Serves a synthetic block for every height, optionally failing at one.
struct Synthetic {
    fail_at: Option<u64>,
}

#[async_trait]
impl BlockSource for Synthetic {
    async fn block_data(&self, height: u64) -> Result<BlockData, IndexerError> {
        if self.fail_at == Some(height) {
            return Err(IndexerError::Rpc(format!("block {height} unavailable")));
        }
        Ok(BlockData {
            height,
            block: json!({ "header": { "height": height.to_string() } }),
            block_results: json!({ "height": height.to_string() }),
            txs: vec![],
            events: vec![],
        })
    }

    async fn block_heights(&self) -> Result<BlockHeights, IndexerError> {
        Ok(BlockHeights {
            earliest: 1,
            latest: 1_000_000,
        })
    }
}

pub(crate) fn block_source() -> Arc<dyn BlockSource> {
    Arc::new(Synthetic { fail_at: None })
}

pub(crate) fn failing_source(height: u64) -> Arc<dyn BlockSource> {
    Arc::new(Synthetic {
        fail_at: Some(height),
    })
}

struct Recorder {
    name: String,
    log: Log,
    inner: Option<Arc<dyn Persister>>,
}

#[async_trait]
impl BlockHandler for Recorder {
    async fn handle_block(&self, view: BlockView<'_>) -> Result<(), IndexerError> {
        self.log.push(format!("{}:block:{}", self.name, view.height));
        Ok(())
    }
}

#[async_trait]
impl Persister for Recorder {
    async fn get_unprocessed_block_ranges(&self) -> Result<Vec<BlockRange>, IndexerError> {
        match &self.inner {
            Some(inner) => inner.get_unprocessed_block_ranges().await,
            None => Ok(vec![]),
        }
    }

    async fn persist_block(&self, height: u64) -> Result<(), IndexerError> {
        self.log.push(format!("{}:persist:{height}", self.name));
        match &self.inner {
            Some(inner) => inner.persist_block(height).await,
            None => Ok(()),
        }
    }
}

/// Logs `name:block:h`, `name:persist:h` and `name:destroy`.
pub(crate) struct RecordingIndexer(Arc<Recorder>);

impl RecordingIndexer {
    pub(crate) fn new(name: &str, log: &Log) -> Self {
        Self(Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            inner: None,
        }))
    }

    pub(crate) fn with_persister(name: &str, log: &Log, inner: Arc<dyn Persister>) -> Self {
        Self(Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            inner: Some(inner),
        }))
    }
}

#[async_trait]
impl Indexer for RecordingIndexer {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::block(self.0.clone())]
    }

    async fn destroy(&self) -> Result<(), IndexerError> {
        self.0.log.push(format!("{}:destroy", self.0.name));
        Ok(())
    }
}

impl PersistentIndexer for RecordingIndexer {
    fn persister(&self) -> Arc<dyn Persister> {
        self.0.clone()
    }
}
