//! Persister contract: the record of which heights have been fully processed.
//!
//! Implementations keep a table of `(id, start_height, end_height)` rows and
//! live in `cometindex-storage`. The bound and gap computation is shared here
//! so every backend answers [`Persister::get_unprocessed_block_ranges`] the same way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::range::compute_gaps;
use crate::types::{BlockHeights, BlockRange, PersistedRange};

/// Source of truth for processed block heights.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Compact stored ranges, then return the gaps a backfill should fill.
    async fn get_unprocessed_block_ranges(&self) -> Result<Vec<BlockRange>, IndexerError>;

    /// Record `height` as processed. Persisting the same height twice is harmless.
    async fn persist_block(&self, height: u64) -> Result<(), IndexerError>;
}

/// Blocks behind the tip a backfill leaves to the live indexer by default.
pub const DEFAULT_LATEST_BLOCK_BUFFER: u64 = 20;

fn default_latest_block_buffer() -> u64 {
    DEFAULT_LATEST_BLOCK_BUFFER
}

/// Tuning shared by all persister backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersisterConfig {
    /// Never report heights below this one as unprocessed.
    #[serde(default)]
    pub min_block_height: Option<u64>,
    /// Blocks behind the chain tip left alone for a live indexer.
    #[serde(default = "default_latest_block_buffer")]
    pub latest_block_buffer: u64,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            min_block_height: None,
            latest_block_buffer: DEFAULT_LATEST_BLOCK_BUFFER,
        }
    }
}

impl PersisterConfig {
    /// `[max(min_block_height, earliest), min(latest - buffer, last processed height)]`.
    ///
    /// `None` when nothing has been processed yet.
    pub fn bound(&self, heights: BlockHeights, stored: &[BlockRange]) -> Option<(u64, u64)> {
        let last_processed = stored.iter().map(|r| r.end_height).max()?;
        let lower = self.min_block_height.unwrap_or(0).max(heights.earliest);
        let upper = heights
            .latest
            .saturating_sub(self.latest_block_buffer)
            .min(last_processed);
        Some((lower, upper))
    }

    /// Gaps in `stored` within [`PersisterConfig::bound`].
    pub fn unprocessed_ranges(
        &self,
        heights: BlockHeights,
        stored: &[BlockRange],
    ) -> Result<Vec<BlockRange>, IndexerError> {
        match self.bound(heights, stored) {
            Some((lower, upper)) => compute_gaps(lower, upper, stored),
            None => Ok(vec![]),
        }
    }
}

/// What a single-block persist does to the stored rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistAction {
    AlreadyCovered,
    /// Row `id` ends at `height - 1`.
    ExtendEnd { id: i64 },
    /// Row `id` starts at `height + 1`.
    ExtendStart { id: i64 },
    Insert,
}

/// Pick the row to grow for `height`, preferring a left neighbour.
pub fn plan_persist(height: u64, rows: &[PersistedRange]) -> PersistAction {
    if rows.iter().any(|r| r.start_height <= height && height <= r.end_height) {
        return PersistAction::AlreadyCovered;
    }
    if let Some(r) = rows
        .iter()
        .find(|r| height > 0 && r.end_height == height - 1)
    {
        return PersistAction::ExtendEnd { id: r.id };
    }
    if let Some(r) = rows
        .iter()
        .find(|r| height < u64::MAX && r.start_height == height + 1)
    {
        return PersistAction::ExtendStart { id: r.id };
    }
    PersistAction::Insert
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    fn row(id: i64, start: u64, end: u64) -> PersistedRange {
        PersistedRange {
            id,
            start_height: start,
            end_height: end,
        }
    }

    const HEIGHTS: BlockHeights = BlockHeights {
        earliest: 1_000,
        latest: 5_000,
    };

    #[test]
    fn empty_store_has_nothing_to_backfill() {
        let cfg = PersisterConfig::default();
        assert_eq!(cfg.bound(HEIGHTS, &[]), None);
        assert!(cfg.unprocessed_ranges(HEIGHTS, &[]).unwrap().is_empty());
    }

    #[test]
    fn upper_bound_is_last_processed_height() {
        let cfg = PersisterConfig::default();
        let stored = [r(1_200, 1_300), r(1_500, 1_600)];
        assert_eq!(cfg.bound(HEIGHTS, &stored), Some((1_000, 1_600)));
        assert_eq!(
            cfg.unprocessed_ranges(HEIGHTS, &stored).unwrap(),
            vec![r(1_000, 1_199), r(1_301, 1_499)]
        );
    }

    #[test]
    fn min_height_and_buffer_narrow_the_bound() {
        let cfg = PersisterConfig {
            min_block_height: Some(1_250),
            latest_block_buffer: 20,
        };
        let stored = [r(4_000, 5_000)];
        assert_eq!(cfg.bound(HEIGHTS, &stored), Some((1_250, 4_980)));
        assert_eq!(
            cfg.unprocessed_ranges(HEIGHTS, &stored).unwrap(),
            vec![r(1_250, 3_999)]
        );
    }

    #[test]
    fn default_buffer_keeps_the_tip_out_of_backfills() {
        let cfg = PersisterConfig::default();
        assert_eq!(cfg.latest_block_buffer, DEFAULT_LATEST_BLOCK_BUFFER);
        let from_json: PersisterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(from_json, cfg);

        // live indexer has reached the tip but 4_990..=4_999 are still in flight
        let stored = [r(1_000, 4_989), r(5_000, 5_000)];
        assert_eq!(cfg.bound(HEIGHTS, &stored), Some((1_000, 4_980)));
        assert!(cfg.unprocessed_ranges(HEIGHTS, &stored).unwrap().is_empty());
    }

    #[test]
    fn persist_prefers_left_neighbour() {
        let rows = [row(1, 1, 4), row(2, 6, 9)];
        assert_eq!(plan_persist(5, &rows), PersistAction::ExtendEnd { id: 1 });
        assert_eq!(plan_persist(10, &rows), PersistAction::ExtendEnd { id: 2 });
        assert_eq!(plan_persist(3, &rows), PersistAction::AlreadyCovered);
        assert_eq!(plan_persist(12, &rows), PersistAction::Insert);
        assert_eq!(plan_persist(0, &rows), PersistAction::ExtendStart { id: 1 });
    }
}
