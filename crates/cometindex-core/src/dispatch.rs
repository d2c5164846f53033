//! Fan one block out to every registered indexer, then persist it.
//!
//! Shared by the live pipeline and the backfiller. Indexers run in
//! registration order and subscriptions in list order. The first error aborts
//! the block, so a height is only persisted by an indexer whose subscriptions
//! all succeeded.

use crate::error::IndexerError;
use crate::indexer::RegisteredIndexer;
use crate::subscription::{BlockView, EventView, Subscription, TxView};
use crate::types::BlockData;

/// Dispatch `data` to all indexers; persist per indexer when `should_persist`.
pub async fn process_block(
    indexers: &[RegisteredIndexer],
    data: &BlockData,
    should_persist: bool,
) -> Result<(), IndexerError> {
    for indexer in indexers {
        for subscription in indexer.subscriptions() {
            dispatch_subscription(&subscription, data).await?;
        }

        if should_persist {
            if let Some(persister) = indexer.persister() {
                persister.persist_block(data.height).await?;
            }
        }
    }

    tracing::debug!(
        height = data.height,
        indexers = indexers.len(),
        events = data.events.len(),
        "block dispatched"
    );
    Ok(())
}

async fn dispatch_subscription(
    subscription: &Subscription,
    data: &BlockData,
) -> Result<(), IndexerError> {
    match subscription {
        Subscription::Block(handler) => {
            handler
                .handle_block(BlockView {
                    height: data.height,
                    block: &data.block,
                    block_results: &data.block_results,
                })
                .await
        }
        Subscription::Tx(handler) => {
            handler
                .handle_txs(TxView {
                    height: data.height,
                    txs: &data.txs,
                })
                .await
        }
        Subscription::Event { handler, .. } => {
            for event in data.events.iter().filter(|e| subscription.wants_event(e)) {
                handler
                    .handle_event(EventView {
                        height: data.height,
                        event_type: &event.kind,
                        attributes: &event.attributes,
                    })
                    .await?;
            }
            Ok(())
        }
    }
}
