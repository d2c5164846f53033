//! cometindex-core: foundation for the Tendermint/CometBFT block indexer.
//!
//! # Architecture
//!
//! ```text
//! ConnectionClient ──add_event──► EventQueue ──drain──► IndexingPipeline
//!                                                          │
//!                         BlockSource::block_data(height) ◄┘
//!                                                          │
//!                     dispatch::process_block ─► Indexer subscriptions
//!                                                          │
//!                                  Persister::persist_block ◄┘
//!
//! Backfiller: Persister::get_unprocessed_block_ranges ─► range::compute_gaps
//!             ─► dispatch::process_block per height
//! ```

pub mod dispatch;
pub mod error;
pub mod indexer;
pub mod persister;
pub mod queue;
pub mod range;
pub mod retry;
pub mod source;
pub mod subscription;
pub mod types;

pub use dispatch::process_block;
pub use error::IndexerError;
pub use indexer::{Indexer, PersistentIndexer, RegisteredIndexer};
pub use persister::{Persister, PersisterConfig};
pub use queue::{EventQueue, EventSink};
pub use retry::{ErrorRetrier, ExponentialBackoff, FixedInterval, Retrier, RetryConfig, RetryHooks};
pub use source::BlockSource;
pub use subscription::{
    BlockHandler, BlockView, EventFilter, EventHandler, EventView, Subscription, TxHandler, TxView,
};
pub use types::{BlockData, BlockHeights, BlockRange, QueueItem, TmEvent};
