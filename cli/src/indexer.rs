//! The indexer the CLI runs: logs what it sees and records processed heights.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use cometindex_core::{
    BlockHandler, BlockView, EventFilter, EventHandler, EventView, Indexer, IndexerError,
    PersistentIndexer, Persister, Subscription, TxHandler, TxView,
};

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    txs: AtomicU64,
    events: AtomicU64,
}

#[async_trait]
impl BlockHandler for Counters {
    async fn handle_block(&self, view: BlockView<'_>) -> Result<(), IndexerError> {
        let blocks = self.blocks.fetch_add(1, Ordering::Relaxed) + 1;
        let time = view.block.pointer("/header/time").and_then(|t| t.as_str());
        info!(height = view.height, time, blocks, "block");
        Ok(())
    }
}

#[async_trait]
impl TxHandler for Counters {
    async fn handle_txs(&self, view: TxView<'_>) -> Result<(), IndexerError> {
        self.txs.fetch_add(view.txs.len() as u64, Ordering::Relaxed);
        debug!(height = view.height, txs = view.txs.len(), "transactions");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Counters {
    async fn handle_event(&self, view: EventView<'_>) -> Result<(), IndexerError> {
        self.events.fetch_add(1, Ordering::Relaxed);
        info!(
            height = view.height,
            event = view.event_type,
            attributes = ?view.attributes,
            "event"
        );
        Ok(())
    }
}

/// Logs every block and the events passing `filter`.
pub struct LoggingIndexer {
    counters: Arc<Counters>,
    filter: Option<EventFilter>,
    persister: Arc<dyn Persister>,
}

impl LoggingIndexer {
    pub fn new(filter: Option<EventFilter>, persister: Arc<dyn Persister>) -> Self {
        Self {
            counters: Arc::default(),
            filter,
            persister,
        }
    }

    /// `(blocks, txs, events)` seen so far.
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.counters.blocks.load(Ordering::Relaxed),
            self.counters.txs.load(Ordering::Relaxed),
            self.counters.events.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Indexer for LoggingIndexer {
    fn name(&self) -> &str {
        "cometindex-cli"
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions = vec![
            Subscription::block(self.counters.clone()),
            Subscription::tx(self.counters.clone()),
        ];
        if let Some(filter) = &self.filter {
            subscriptions.push(Subscription::filtered_events(
                filter.clone(),
                self.counters.clone(),
            ));
        }
        subscriptions
    }

    async fn destroy(&self) -> Result<(), IndexerError> {
        let (blocks, txs, events) = self.totals();
        info!(blocks, txs, events, "indexer finished");
        Ok(())
    }
}

impl PersistentIndexer for LoggingIndexer {
    fn persister(&self) -> Arc<dyn Persister> {
        self.persister.clone()
    }
}

/// Build a filter from `--event` (exact) and `--event-contains` (substring) flags.
pub fn event_filter(matches: &[String], contains: &[String]) -> Option<EventFilter> {
    if matches.is_empty() && contains.is_empty() {
        return None;
    }
    Some(EventFilter {
        matches: matches.to_vec(),
        contains: contains.to_vec(),
    })
}
