//! The live indexing pipeline.
//!
//! A [`ConnectionClient`] pushes connection changes and new heights into an
//! [`EventQueue`]. A single drain task pops them in FIFO order, fetches each
//! block from the [`BlockSource`] and hands it to every registered indexer
//! before moving on, so blocks are dispatched strictly by ascending height.
//!
//! ```text
//! listener task:  ConnectionClient::listen ──add_event──► EventQueue
//! drain task:     EventQueue::pop ─► block_data(h) ─► process_block ─► persist_block
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use cometindex_core::dispatch::process_block;
use cometindex_core::error::IndexerError;
use cometindex_core::indexer::RegisteredIndexer;
use cometindex_core::queue::{EventQueue, EventSink};
use cometindex_core::retry::Retrier;
use cometindex_core::source::BlockSource;
use cometindex_core::types::{ConnectionEvent, NewBlockEvent, QueueItem};
use cometindex_rpc::{ConnectionClient, Transport};

use crate::config::PipelineConfig;

struct PipelineInner {
    client: ConnectionClient,
    source: Arc<dyn BlockSource>,
    indexers: Vec<RegisteredIndexer>,
    queue: Arc<EventQueue>,
    destroyed: AtomicBool,
    // set by the drain task before it disconnects on a failed block
    halted: AtomicBool,
    last_height: Mutex<Option<u64>>,
    config: PipelineConfig,
}

/// Live indexer: one connection, one ordered drain task, many indexers.
pub struct IndexingPipeline {
    inner: Arc<PipelineInner>,
    started: AtomicBool,
    tasks: tokio::sync::Mutex<JoinSet<Result<(), IndexerError>>>,
    abort_handles: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for IndexingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingPipeline")
            .field("client", &self.inner.client)
            .field("indexers", &self.inner.indexers)
            .field("queued", &self.inner.queue.len())
            .field("last_height", &self.last_height())
            .finish()
    }
}

impl IndexingPipeline {
    /// Wire `transport` to a fresh queue. Nothing runs until [`IndexingPipeline::start`].
    pub fn new(
        transport: Box<dyn Transport>,
        retrier: Retrier,
        source: Arc<dyn BlockSource>,
        indexers: Vec<RegisteredIndexer>,
        config: PipelineConfig,
    ) -> Self {
        let queue = Arc::new(EventQueue::new());
        let client = ConnectionClient::from_boxed(transport, retrier, queue.clone());
        Self {
            inner: Arc::new(PipelineInner {
                client,
                source,
                indexers,
                queue,
                destroyed: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                last_height: Mutex::new(None),
                config,
            }),
            started: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            abort_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the listener and drain tasks.
    pub async fn start(&self) -> Result<(), IndexerError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(IndexerError::Config("pipeline was destroyed".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(IndexerError::Config("pipeline already started".into()));
        }

        info!(
            transport = self.inner.client.transport_name(),
            indexers = self.inner.indexers.len(),
            "Starting indexing pipeline"
        );

        let mut tasks = self.tasks.lock().await;
        let listener = self.inner.clone();
        let drain = self.inner.clone();
        let handles = vec![
            tasks.spawn(async move { listener.listen().await }),
            tasks.spawn(async move { drain.run_drain_loop().await }),
        ];
        self.abort_handles.lock().unwrap().extend(handles);
        Ok(())
    }

    /// Resolve once both tasks have finished, or with the first error either
    /// of them hits (connection retries exhausted, ordering violation, failed
    /// block). A listener that stops outside [`IndexingPipeline::destroy`] is an error.
    pub async fn wait(&self) -> Result<(), IndexerError> {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    return Err(IndexerError::Aborted {
                        reason: join_err.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Drain everything currently queued. The drain task calls this in a loop.
    pub async fn process_queue(&self) -> Result<usize, IndexerError> {
        self.inner.process_queue().await
    }

    /// Whether the live connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.client.connected()
    }

    /// Highest height fully dispatched so far.
    pub fn last_height(&self) -> Option<u64> {
        *self.inner.last_height.lock().unwrap()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn client(&self) -> &ConnectionClient {
        &self.inner.client
    }

    /// Tear the pipeline down.
    ///
    /// Disconnects first so nothing new is queued, gives an in-flight block
    /// `destroy_delay` to finish, then drops whatever is still queued and
    /// destroys every indexer concurrently. Safe before `start` and safe to
    /// call twice.
    pub async fn destroy(&self) -> Result<(), IndexerError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Destroying indexing pipeline");

        if let Err(err) = self.inner.client.disconnect().await {
            warn!(error = %err, "error while disconnecting live client");
        }
        self.inner.queue.wake();

        tokio::time::sleep(self.inner.config.destroy_delay()).await;

        let dropped = self.inner.queue.clear();
        if dropped > 0 {
            warn!(dropped, "dropped queued events on destroy");
        }
        for handle in self.abort_handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        let results = join_all(self.inner.indexers.iter().map(|i| i.destroy())).await;
        let mut first_err = None;
        for (indexer, result) in self.inner.indexers.iter().zip(results) {
            if let Err(err) = result {
                error!(indexer = indexer.name(), error = %err, "indexer destroy failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl EventSink for IndexingPipeline {
    fn add_event(&self, item: QueueItem) {
        self.inner.queue.push(item);
    }
}

impl PipelineInner {
    async fn listen(&self) -> Result<(), IndexerError> {
        match self.client.listen().await {
            Ok(()) if self.destroyed.load(Ordering::SeqCst) || self.halted.load(Ordering::SeqCst) => {
                debug!("live client stopped listening");
                Ok(())
            }
            Ok(()) => {
                error!("live client stopped before the pipeline was destroyed");
                Err(IndexerError::Aborted {
                    reason: "live client disconnected".into(),
                })
            }
            Err(err) => {
                error!(error = %err, "live connection lost");
                Err(err.into())
            }
        }
    }

    async fn run_drain_loop(&self) -> Result<(), IndexerError> {
        loop {
            if let Err(err) = self.process_queue().await {
                error!(error = %err, "indexing pipeline aborted");
                self.halted.store(true, Ordering::SeqCst);
                if let Err(close_err) = self.client.disconnect().await {
                    warn!(error = %close_err, "error while disconnecting live client");
                }
                return Err(err);
            }
            if self.destroyed.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.queue.wait(self.config.drain_interval()).await;
        }
    }

    async fn process_queue(&self) -> Result<usize, IndexerError> {
        let mut processed = 0;
        while let Some(item) = self.queue.pop() {
            match item {
                QueueItem::Connection(ConnectionEvent { is_start }) => {
                    debug!(is_start, "connection event");
                }
                QueueItem::NewBlock(NewBlockEvent { height }) => {
                    self.process_height(height).await?;
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    async fn process_height(&self, height: u64) -> Result<(), IndexerError> {
        let previous = *self.last_height.lock().unwrap();
        if let Some(previous) = previous {
            if height < previous {
                return Err(IndexerError::OutOfOrder { height, previous });
            }
        }

        let data = self.source.block_data(height).await?;
        process_block(&self.indexers, &data, true).await?;

        *self.last_height.lock().unwrap() = Some(height);
        debug!(height, events = data.events.len(), "indexed block");
        Ok(())
    }
}
