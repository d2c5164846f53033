//! Historical replay of the heights a persister has not seen yet.
//!
//! # Orders
//! - ascending / descending: every unprocessed range, one block at a time
//! - concurrent: unprocessed ranges cut into 200-block chunks, each chunk
//!   split evenly across workers (at least 100 blocks per worker)
//! - specific / concurrent-specific: an explicit list of heights
//!
//! Each block goes through the same dispatch as the live pipeline.

use std::sync::Arc;

use futures::future::join_all;
use futures::{StreamExt, TryStreamExt};
use tracing::{error, info};

use cometindex_core::dispatch::process_block;
use cometindex_core::error::IndexerError;
use cometindex_core::indexer::{PersistentIndexer, RegisteredIndexer};
use cometindex_core::range::{split_range_evenly, split_ranges_by_size};
use cometindex_core::source::BlockSource;
use cometindex_core::types::BlockRange;

use crate::config::BackfillStrategy;

/// Progress is logged once per this many blocks.
pub const LOG_PER_BLOCKS: u64 = 10_000;
/// Concurrent backfills work through gaps in chunks of at most this many blocks.
pub const MAX_BLOCKS_PER_CHUNK: u64 = 200;
/// A chunk is only split across workers if each gets at least this many blocks.
pub const MIN_BLOCKS_PER_WORKER: u64 = 100;

/// Replays blocks for a single [`PersistentIndexer`].
pub struct Backfiller {
    indexer: Arc<dyn PersistentIndexer>,
    registered: Vec<RegisteredIndexer>,
    source: Arc<dyn BlockSource>,
    strategy: BackfillStrategy,
}

impl std::fmt::Debug for Backfiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backfiller")
            .field("indexer", &self.indexer.name())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl Backfiller {
    pub fn new(
        indexer: Arc<dyn PersistentIndexer>,
        source: Arc<dyn BlockSource>,
        strategy: BackfillStrategy,
    ) -> Self {
        Self {
            registered: vec![RegisteredIndexer::persistent(indexer.clone())],
            indexer,
            source,
            strategy,
        }
    }

    pub fn strategy(&self) -> &BackfillStrategy {
        &self.strategy
    }

    /// Run the backfill to completion. Returns the number of blocks processed.
    ///
    /// The first failing block stops its range and is returned; blocks already
    /// persisted stay persisted, so a rerun resumes from the remaining gaps.
    pub async fn start(&self) -> Result<u64, IndexerError> {
        info!(indexer = self.indexer.name(), order = ?self.strategy.order(), "Starting backfill...");

        let processed = match &self.strategy {
            BackfillStrategy::Ascending => self.backfill_sequential(true).await?,
            BackfillStrategy::Descending => self.backfill_sequential(false).await?,
            BackfillStrategy::Concurrent { num_workers } => {
                self.backfill_concurrent(*num_workers).await?
            }
            BackfillStrategy::Specific {
                heights,
                should_persist,
            } => {
                for &height in heights {
                    self.backfill_block(height, *should_persist).await?;
                }
                heights.len() as u64
            }
            BackfillStrategy::ConcurrentSpecific {
                heights,
                should_persist,
                num_workers,
            } => {
                futures::stream::iter(heights.iter().copied())
                    .map(|height| self.backfill_block(height, *should_persist))
                    .buffer_unordered((*num_workers).max(1))
                    .try_collect::<Vec<()>>()
                    .await?;
                heights.len() as u64
            }
        };

        info!(processed, "Done with backfill!");
        Ok(processed)
    }

    /// Release the indexer.
    pub async fn destroy(&self) -> Result<(), IndexerError> {
        self.indexer.destroy().await
    }

    async fn unprocessed_ranges(&self) -> Result<Vec<BlockRange>, IndexerError> {
        let ranges = self.indexer.persister().get_unprocessed_block_ranges().await?;
        if !ranges.is_empty() {
            let listed: Vec<String> = ranges.iter().map(ToString::to_string).collect();
            info!(ranges = %listed.join(", "), "Backfilling the following ranges");
        }
        Ok(ranges)
    }

    async fn backfill_sequential(&self, ascending: bool) -> Result<u64, IndexerError> {
        let mut ranges = self.unprocessed_ranges().await?;
        if ascending {
            ranges.sort_by_key(|r| r.start_height);
        } else {
            ranges.sort_by_key(|r| std::cmp::Reverse(r.start_height));
        }

        let mut processed = 0;
        for range in ranges {
            processed += self.backfill_range(range, ascending).await?;
        }
        Ok(processed)
    }

    async fn backfill_concurrent(&self, num_workers: usize) -> Result<u64, IndexerError> {
        let ranges = self.unprocessed_ranges().await?;

        let mut processed = 0;
        for chunk in split_ranges_by_size(&ranges, MAX_BLOCKS_PER_CHUNK) {
            let parts = split_range_evenly(chunk, num_workers as u64, MIN_BLOCKS_PER_WORKER);
            let results = join_all(parts.into_iter().map(|p| self.backfill_range(p, true))).await;
            for result in results {
                processed += result?;
            }
        }
        Ok(processed)
    }

    async fn backfill_range(&self, range: BlockRange, ascending: bool) -> Result<u64, IndexerError> {
        let BlockRange {
            start_height: min,
            end_height: max,
        } = range;
        let heights: Box<dyn Iterator<Item = u64> + Send> = if ascending {
            Box::new(range.heights())
        } else {
            Box::new(range.heights().rev())
        };

        let mut processed = 0;
        let mut failure = None;
        for height in heights {
            if let Err(err) = self.backfill_block(height, true).await {
                error!(height, error = %err, "Error in backfill");
                failure = Some(err);
                break;
            }
            processed += 1;

            if ascending && height % LOG_PER_BLOCKS == LOG_PER_BLOCKS - 1 {
                let from = min.max(height.saturating_sub(LOG_PER_BLOCKS - 1));
                info!(from, to = height, "Processed blocks");
            }
            if !ascending && height % LOG_PER_BLOCKS == 0 {
                let to = max.min(height.saturating_add(LOG_PER_BLOCKS - 1));
                info!(from = height, to, "Processed blocks");
            }
        }

        if processed > 0 {
            let (from, to) = if ascending {
                (min, min + processed - 1)
            } else {
                (max - processed + 1, max)
            };
            info!(from, to, "Finished backfilling blocks");
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(processed),
        }
    }

    async fn backfill_block(&self, height: u64, should_persist: bool) -> Result<(), IndexerError> {
        let data = self.source.block_data(height).await?;
        process_block(&self.registered, &data, should_persist).await
    }
}
