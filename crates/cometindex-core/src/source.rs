//! The block-fetch collaborator consumed by the pipeline, backfiller and persisters.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{BlockData, BlockHeights};

/// Fetches block payloads and the node's served height range.
///
/// Implementations are expected to apply their own retry policy.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn block_data(&self, height: u64) -> Result<BlockData, IndexerError>;

    async fn block_heights(&self) -> Result<BlockHeights, IndexerError>;
}
