//! cometindex-engine: live indexing pipeline, backfiller, and builder API.

pub mod backfill;
pub mod builder;
pub mod config;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use backfill::Backfiller;
pub use builder::{BackfillHarnessBuilder, IndexerHarnessBuilder};
pub use config::{BackfillConfig, BackfillOrder, BackfillStrategy, EndpointConfig, LiveConfig, PipelineConfig};
pub use pipeline::IndexingPipeline;
