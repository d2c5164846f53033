//! Shared data model: block ranges, block payloads, and queue items.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;

// ─── Block ranges ─────────────────────────────────────────────────────────────

/// An inclusive span of block heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start_height: u64,
    pub end_height: u64,
}

impl BlockRange {
    /// Build a range, rejecting `start > end`.
    pub fn new(start_height: u64, end_height: u64) -> Result<Self, IndexerError> {
        if start_height > end_height {
            return Err(IndexerError::InvalidRange(format!(
                "start {start_height} is after end {end_height}"
            )));
        }
        Ok(Self {
            start_height,
            end_height,
        })
    }

    /// A range covering exactly one block.
    pub fn single(height: u64) -> Self {
        Self {
            start_height: height,
            end_height: height,
        }
    }

    /// Number of blocks in the range (never zero).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end_height - self.start_height + 1
    }

    pub fn contains(&self, height: u64) -> bool {
        self.start_height <= height && height <= self.end_height
    }

    /// Heights in ascending order.
    pub fn heights(&self) -> std::ops::RangeInclusive<u64> {
        self.start_height..=self.end_height
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_height, self.end_height)
    }
}

/// A stored range row. The `id` never leaves the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedRange {
    pub id: i64,
    pub start_height: u64,
    pub end_height: u64,
}

impl PersistedRange {
    pub fn range(&self) -> BlockRange {
        BlockRange {
            start_height: self.start_height,
            end_height: self.end_height,
        }
    }
}

/// Earliest and latest heights a node can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeights {
    pub earliest: u64,
    pub latest: u64,
}

// ─── Events and block payloads ────────────────────────────────────────────────

/// A key/value attribute as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventAttribute {
    pub key: String,
    pub value: String,
}

/// A Tendermint event in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTmEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<RawEventAttribute>,
}

/// A Tendermint event with attributes collected into a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: BTreeMap<String, String>,
}

impl From<RawTmEvent> for TmEvent {
    /// Later duplicates of a key overwrite earlier ones.
    fn from(raw: RawTmEvent) -> Self {
        let attributes = raw
            .attributes
            .into_iter()
            .map(|attr| (attr.key, attr.value))
            .collect();
        Self {
            kind: raw.kind,
            attributes,
        }
    }
}

/// Everything the indexers see for one height.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub height: u64,
    /// The `block` object from the `block` RPC method.
    pub block: Value,
    /// The full `block_results` response.
    pub block_results: Value,
    /// Per-transaction execution results, in block order.
    pub txs: Vec<Value>,
    /// Transaction events flattened in transaction order, then event order.
    pub events: Vec<TmEvent>,
}

// ─── Queue items ──────────────────────────────────────────────────────────────

/// A connection was established (`is_start`) or torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub is_start: bool,
}

/// A new block is available at `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlockEvent {
    pub height: u64,
}

/// An item on the pipeline's FIFO queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItem {
    Connection(ConnectionEvent),
    NewBlock(NewBlockEvent),
}

impl QueueItem {
    pub fn connected() -> Self {
        Self::Connection(ConnectionEvent { is_start: true })
    }

    pub fn disconnected() -> Self {
        Self::Connection(ConnectionEvent { is_start: false })
    }

    pub fn new_block(height: u64) -> Self {
        Self::NewBlock(NewBlockEvent { height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_rejects_inverted_bounds() {
        assert!(BlockRange::new(5, 4).is_err());
        let r = BlockRange::new(4, 5).unwrap();
        assert_eq!(r.len(), 2);
        assert!(r.contains(5));
        assert!(!r.contains(6));
        assert_eq!(r.to_string(), "[4, 5]");
    }

    #[test]
    fn raw_event_flattens_attributes() {
        let raw: RawTmEvent = serde_json::from_value(serde_json::json!({
            "type": "transfer",
            "attributes": [
                { "key": "sender", "value": "cosmos1a" },
                { "key": "amount", "value": "10uatom" },
                { "key": "amount", "value": "20uatom" }
            ]
        }))
        .unwrap();

        let event = TmEvent::from(raw);
        assert_eq!(event.kind, "transfer");
        assert_eq!(event.attributes.len(), 2);
        assert_eq!(event.attributes["sender"], "cosmos1a");
        assert_eq!(event.attributes["amount"], "20uatom");
    }
}
