//! In-memory persister.
//!
//! Keeps processed ranges in RAM. Useful for tests and for indexers that
//! re-derive their state on every start.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use cometindex_core::error::IndexerError;
use cometindex_core::persister::{plan_persist, PersistAction, Persister, PersisterConfig};
use cometindex_core::range::merge_ranges;
use cometindex_core::source::BlockSource;
use cometindex_core::types::{BlockRange, PersistedRange};

/// Processed-range store held in a mutex-guarded vector.
///
/// All data is lost when the process exits.
pub struct InMemoryPersister {
    rows: Mutex<Vec<PersistedRange>>,
    next_id: AtomicI64,
    source: Arc<dyn BlockSource>,
    config: PersisterConfig,
}

impl InMemoryPersister {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self::with_config(source, PersisterConfig::default())
    }

    pub fn with_config(source: Arc<dyn BlockSource>, config: PersisterConfig) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            source,
            config,
        }
    }

    /// Seed the store with already-processed ranges, one row each.
    pub fn with_ranges(self, ranges: &[BlockRange]) -> Self {
        {
            let mut rows = self.rows.lock().unwrap();
            for r in ranges {
                rows.push(PersistedRange {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    start_height: r.start_height,
                    end_height: r.end_height,
                });
            }
        }
        self
    }

    /// Stored ranges sorted by start height.
    pub fn ranges(&self) -> Vec<BlockRange> {
        let mut ranges: Vec<BlockRange> =
            self.rows.lock().unwrap().iter().map(PersistedRange::range).collect();
        ranges.sort_by_key(|r| r.start_height);
        ranges
    }

    /// Number of stored rows.
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn merge(&self) {
        let mut rows = self.rows.lock().unwrap();
        rows.sort_by_key(|r| r.start_height);
        let plan = merge_ranges(&rows);
        if plan.is_noop() {
            return;
        }
        debug!(merged = plan.to_delete.len(), "merging block ranges");
        *rows = plan.to_update;
    }
}

impl std::fmt::Debug for InMemoryPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPersister")
            .field("rows", &self.row_count())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Persister for InMemoryPersister {
    async fn get_unprocessed_block_ranges(&self) -> Result<Vec<BlockRange>, IndexerError> {
        self.merge();
        let heights = self.source.block_heights().await?;
        self.config.unprocessed_ranges(heights, &self.ranges())
    }

    async fn persist_block(&self, height: u64) -> Result<(), IndexerError> {
        let mut rows = self.rows.lock().unwrap();
        match plan_persist(height, &rows) {
            PersistAction::AlreadyCovered => {}
            PersistAction::ExtendEnd { id } => {
                if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                    row.end_height = height;
                }
            }
            PersistAction::ExtendStart { id } => {
                if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                    row.start_height = height;
                }
            }
            PersistAction::Insert => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                rows.push(PersistedRange {
                    id,
                    start_height: height,
                    end_height: height,
                });
            }
        }
        Ok(())
    }
}
