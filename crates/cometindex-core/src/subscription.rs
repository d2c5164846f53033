//! Subscriptions: which slice of each block an indexer wants, and the
//! callbacks that receive it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;
use crate::types::TmEvent;

/// Header plus execution results of one block.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    pub height: u64,
    pub block: &'a Value,
    pub block_results: &'a Value,
}

/// Transaction results of one block, in block order.
#[derive(Debug, Clone, Copy)]
pub struct TxView<'a> {
    pub height: u64,
    pub txs: &'a [Value],
}

/// A single event that passed the subscription filter.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub height: u64,
    pub event_type: &'a str,
    pub attributes: &'a BTreeMap<String, String>,
}

/// Receives every block.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle_block(&self, view: BlockView<'_>) -> Result<(), IndexerError>;
}

/// Receives the transactions of every block.
#[async_trait]
pub trait TxHandler: Send + Sync {
    async fn handle_txs(&self, view: TxView<'_>) -> Result<(), IndexerError>;
}

/// Receives matching events one at a time.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, view: EventView<'_>) -> Result<(), IndexerError>;
}

/// Event-type filter: a type passes if it equals any entry of `matches` or
/// contains any entry of `contains` as a substring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub contains: Vec<String>,
}

impl EventFilter {
    pub fn matching<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matches: types.into_iter().map(Into::into).collect(),
            contains: vec![],
        }
    }

    pub fn containing<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matches: vec![],
            contains: fragments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        self.matches.iter().any(|m| m == event_type)
            || self.contains.iter().any(|c| event_type.contains(c.as_str()))
    }
}

/// One registration on an indexer. List order is dispatch order.
#[derive(Clone)]
pub enum Subscription {
    Block(Arc<dyn BlockHandler>),
    Tx(Arc<dyn TxHandler>),
    /// `None` filter = every event.
    Event {
        filter: Option<EventFilter>,
        handler: Arc<dyn EventHandler>,
    },
}

impl Subscription {
    pub fn block(handler: Arc<dyn BlockHandler>) -> Self {
        Self::Block(handler)
    }

    pub fn tx(handler: Arc<dyn TxHandler>) -> Self {
        Self::Tx(handler)
    }

    pub fn events(handler: Arc<dyn EventHandler>) -> Self {
        Self::Event {
            filter: None,
            handler,
        }
    }

    pub fn filtered_events(filter: EventFilter, handler: Arc<dyn EventHandler>) -> Self {
        Self::Event {
            filter: Some(filter),
            handler,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Tx(_) => "tx",
            Self::Event { .. } => "event",
        }
    }

    /// Whether an EVENT subscription wants this event. Always `false` for
    /// BLOCK and TX subscriptions.
    pub fn wants_event(&self, event: &TmEvent) -> bool {
        match self {
            Self::Event { filter, .. } => filter.as_ref().map_or(true, |f| f.accepts(&event.kind)),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Event { filter, .. } => f.debug_struct("Event").field("filter", filter).finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}
