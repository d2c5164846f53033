//! Indexer capabilities: plain (live only) and persistent (backfillable).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::persister::Persister;
use crate::subscription::Subscription;

/// User code that consumes block data.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Label used in logs and handler errors.
    fn name(&self) -> &str {
        "indexer"
    }

    /// Subscriptions in dispatch order.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Release resources. Called once when the owning pipeline is destroyed.
    async fn destroy(&self) -> Result<(), IndexerError> {
        Ok(())
    }
}

/// An indexer that records processed heights. Only these can be backfilled.
pub trait PersistentIndexer: Indexer {
    fn persister(&self) -> Arc<dyn Persister>;
}

/// An indexer as registered with a pipeline.
#[derive(Clone)]
pub enum RegisteredIndexer {
    Plain(Arc<dyn Indexer>),
    Persistent(Arc<dyn PersistentIndexer>),
}

impl RegisteredIndexer {
    pub fn plain(indexer: Arc<dyn Indexer>) -> Self {
        Self::Plain(indexer)
    }

    pub fn persistent(indexer: Arc<dyn PersistentIndexer>) -> Self {
        Self::Persistent(indexer)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Plain(i) => i.name(),
            Self::Persistent(i) => i.name(),
        }
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        match self {
            Self::Plain(i) => i.subscriptions(),
            Self::Persistent(i) => i.subscriptions(),
        }
    }

    pub fn persister(&self) -> Option<Arc<dyn Persister>> {
        match self {
            Self::Plain(_) => None,
            Self::Persistent(i) => Some(i.persister()),
        }
    }

    pub async fn destroy(&self) -> Result<(), IndexerError> {
        match self {
            Self::Plain(i) => i.destroy().await,
            Self::Persistent(i) => i.destroy().await,
        }
    }
}

impl std::fmt::Debug for RegisteredIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "plain",
            Self::Persistent(_) => "persistent",
        };
        write!(f, "{}({kind})", self.name())
    }
}
