//! Interval algebra over inclusive block ranges.
//!
//! - [`compute_gaps`]: heights inside a bound that no covered range touches
//! - [`merge_ranges`]: compaction plan for touching/overlapping stored rows
//! - [`split_range_evenly`] / [`split_range_by_size`]: work partitioning for backfills

use crate::error::IndexerError;
use crate::types::{BlockRange, PersistedRange};

/// Sub-ranges of `[min_height, max_height]` not covered by any of `covered`.
///
/// `covered` may be unsorted, overlapping, and may extend past the bound.
/// The result is sorted and disjoint. An empty bound (`min > max`) has no gaps.
pub fn compute_gaps(
    min_height: u64,
    max_height: u64,
    covered: &[BlockRange],
) -> Result<Vec<BlockRange>, IndexerError> {
    if min_height > max_height {
        return Ok(vec![]);
    }

    let mut clipped: Vec<BlockRange> = covered
        .iter()
        .filter(|r| r.end_height >= min_height && r.start_height <= max_height)
        .map(|r| BlockRange {
            start_height: r.start_height.max(min_height),
            end_height: r.end_height.min(max_height),
        })
        .collect();

    for r in &clipped {
        if r.start_height > r.end_height
            || r.start_height < min_height
            || r.end_height > max_height
        {
            return Err(IndexerError::InvalidRange(format!(
                "block range {r} outside of [{min_height}, {max_height}]"
            )));
        }
    }

    clipped.sort_by_key(|r| r.start_height);

    let mut gaps = Vec::new();
    let mut frontier = min_height;
    for r in clipped {
        if r.start_height > frontier {
            gaps.push(BlockRange {
                start_height: frontier,
                end_height: r.start_height - 1,
            });
        }
        match r.end_height.checked_add(1) {
            Some(next) => frontier = frontier.max(next),
            // covered through u64::MAX, nothing can follow
            None => return Ok(gaps),
        }
    }

    if frontier <= max_height {
        gaps.push(BlockRange {
            start_height: frontier,
            end_height: max_height,
        });
    }
    Ok(gaps)
}

/// Rows to rewrite and rows to drop after compacting a sorted range set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// One row per merged group, keeping the id of the group's first row.
    pub to_update: Vec<PersistedRange>,
    /// Ids of rows absorbed into an earlier row.
    pub to_delete: Vec<i64>,
}

impl MergePlan {
    /// Surviving rows whose bounds differ from what is stored.
    pub fn changed<'a>(&'a self, original: &'a [PersistedRange]) -> impl Iterator<Item = &'a PersistedRange> {
        self.to_update
            .iter()
            .filter(move |merged| !original.iter().any(|row| row == *merged))
    }

    pub fn is_noop(&self) -> bool {
        self.to_delete.is_empty()
    }
}

/// Coalesce rows where `current.end + 1 >= next.start`.
///
/// Input must be sorted ascending by start height.
pub fn merge_ranges(sorted: &[PersistedRange]) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut iter = sorted.iter();
    let Some(first) = iter.next() else {
        return plan;
    };

    let mut current = *first;
    for next in iter {
        if current.end_height.saturating_add(1) >= next.start_height {
            current.end_height = current.end_height.max(next.end_height);
            plan.to_delete.push(next.id);
        } else {
            plan.to_update.push(current);
            current = *next;
        }
    }
    plan.to_update.push(current);
    plan
}

/// Split `range` into at most `num_split` contiguous parts whose sizes differ by at most one.
///
/// Earlier parts take the remainder. The part count shrinks until every part
/// holds at least `min_blocks_per_range` blocks, so the range comes back whole
/// when it cannot feed two parts of that size.
pub fn split_range_evenly(
    range: BlockRange,
    num_split: u64,
    min_blocks_per_range: u64,
) -> Vec<BlockRange> {
    let total = range.len();
    let mut num_split = num_split.min(total);
    if min_blocks_per_range > 0 {
        num_split = num_split.min(total / min_blocks_per_range);
    }
    if num_split <= 1 {
        return vec![range];
    }

    let base = total / num_split;
    let remainder = total % num_split;
    let mut parts = Vec::with_capacity(num_split as usize);
    let mut start = range.start_height;
    for idx in 0..num_split {
        let size = base + u64::from(idx < remainder);
        let end = start + size - 1;
        parts.push(BlockRange {
            start_height: start,
            end_height: end,
        });
        start = end + 1;
    }
    parts
}

/// [`split_range_evenly`] applied to every range, concatenated in order.
pub fn split_ranges_evenly(
    ranges: &[BlockRange],
    num_split: u64,
    min_blocks_per_range: u64,
) -> Vec<BlockRange> {
    ranges
        .iter()
        .flat_map(|r| split_range_evenly(*r, num_split, min_blocks_per_range))
        .collect()
}

/// Cut `range` into consecutive chunks of at most `size` blocks.
pub fn split_range_by_size(range: BlockRange, size: u64) -> Vec<BlockRange> {
    if size == 0 {
        return vec![range];
    }
    let mut chunks = Vec::new();
    let mut start = range.start_height;
    loop {
        let end = start.saturating_add(size - 1).min(range.end_height);
        chunks.push(BlockRange {
            start_height: start,
            end_height: end,
        });
        if end >= range.end_height {
            return chunks;
        }
        start = end + 1;
    }
}

pub fn split_ranges_by_size(ranges: &[BlockRange], size: u64) -> Vec<BlockRange> {
    ranges
        .iter()
        .flat_map(|r| split_range_by_size(*r, size))
        .collect()
}
