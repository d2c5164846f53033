//! The hand-off point between a live transport and the pipeline's drain task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::types::QueueItem;

/// Where transports report connection changes and new heights.
///
/// `add_event` must not block and must not process the event itself.
pub trait EventSink: Send + Sync {
    fn add_event(&self, item: QueueItem);
}

/// Unbounded FIFO with a wake-up signal for the consumer.
#[derive(Debug, Default)]
pub struct EventQueue {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: QueueItem) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<QueueItem> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything still queued, returning how many items were discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let dropped = items.len();
        items.clear();
        dropped
    }

    /// Wake the consumer without enqueuing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Sleep until something is pushed, [`EventQueue::wake`] is called, or `timeout` passes.
    pub async fn wait(&self, timeout: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

impl EventSink for EventQueue {
    fn add_event(&self, item: QueueItem) {
        self.push(item);
    }
}
