//! Reconnecting live-block client.
//!
//! A [`ConnectionClient`] owns one [`Transport`] and turns its block stream
//! into [`QueueItem`]s on an [`EventSink`]. Lost connections are retried with
//! the client's [`Retrier`]; the attempt counter resets after every successful
//! connect, so the budget bounds consecutive failures only.
//!
//! States: `Disconnected → Connecting → Connected → Listening`, back to
//! `Disconnected` on error, remote close, or [`ConnectionClient::disconnect`].
//! A close the client did not ask for is a dropped connection and is retried
//! like any other transport error.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use cometindex_core::queue::EventSink;
use cometindex_core::retry::{Attempt, Retrier, RetryHooks};
use cometindex_core::types::QueueItem;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Listening,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
        };
        f.write_str(s)
    }
}

/// A source of new-block notifications.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Open the connection.
    ///
    /// `resume_from` is the last height the client emitted, if any. Returns the
    /// height emission continues after; `None` accepts whatever arrives first.
    async fn connect(&self, resume_from: Option<u64>) -> Result<Option<u64>, TransportError>;

    /// Feed heights into `blocks` until the stream ends. `Ok` is a clean close.
    async fn listen_once(&self, blocks: &BlockEmitter<'_>) -> Result<(), TransportError>;

    /// Close the connection. Must tolerate being called when already closed.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Forwards heights to the sink, keeping them strictly increasing.
pub struct BlockEmitter<'a> {
    height: &'a Mutex<Option<u64>>,
    sink: &'a dyn EventSink,
}

impl<'a> BlockEmitter<'a> {
    pub fn new(height: &'a Mutex<Option<u64>>, sink: &'a dyn EventSink) -> Self {
        Self { height, sink }
    }

    /// Last height emitted.
    pub fn height(&self) -> Option<u64> {
        *self.height.lock().unwrap()
    }

    /// Queue `height` unless it is not above the last one. Returns whether it was queued.
    pub fn emit(&self, height: u64) -> bool {
        let mut current = self.height.lock().unwrap();
        if current.is_some_and(|last| height <= last) {
            tracing::debug!(height, last = ?*current, "dropping stale block notification");
            return false;
        }
        *current = Some(height);
        self.sink.add_event(QueueItem::new_block(height));
        true
    }
}

/// Keeps a [`Transport`] connected and listening.
pub struct ConnectionClient {
    transport: Box<dyn Transport>,
    retrier: Retrier,
    sink: std::sync::Arc<dyn EventSink>,
    state: Mutex<ConnectionState>,
    connected: AtomicBool,
    height: Mutex<Option<u64>>,
    stop: watch::Sender<bool>,
}

impl fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .field("height", &self.height())
            .finish()
    }
}

impl ConnectionClient {
    pub fn new(
        transport: impl Transport + 'static,
        retrier: Retrier,
        sink: std::sync::Arc<dyn EventSink>,
    ) -> Self {
        Self::from_boxed(Box::new(transport), retrier, sink)
    }

    pub fn from_boxed(
        transport: Box<dyn Transport>,
        retrier: Retrier,
        sink: std::sync::Arc<dyn EventSink>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            transport,
            retrier,
            sink,
            state: Mutex::new(ConnectionState::Disconnected),
            connected: AtomicBool::new(false),
            height: Mutex::new(None),
            stop,
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last height emitted to the sink.
    pub fn height(&self) -> Option<u64> {
        *self.height.lock().unwrap()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Connect and listen, reconnecting on failure.
    ///
    /// Resolves `Ok` only after [`ConnectionClient::disconnect`], and `Err` once
    /// the retry budget is spent or on a non-retryable error. After
    /// `disconnect` the client stays stopped.
    pub async fn listen(&self) -> Result<(), TransportError> {
        let name = self.transport.name();
        let hooks = RetryHooks::new()
            .on_failed_attempt(move |err: &TransportError, attempt| {
                tracing::warn!(
                    transport = name,
                    attempt,
                    error = %err,
                    "Trying to listen again due to client error"
                );
            })
            .on_failed_last_attempt(move |err: &TransportError, attempts| {
                tracing::error!(
                    transport = name,
                    attempts,
                    error = %err,
                    "Max client retries exceeded, giving up"
                );
            })
            .retry_if(TransportError::is_retryable);

        self.retrier
            .wrap(|attempt| self.listen_session(attempt), hooks)
            .await
    }

    async fn listen_session(&self, attempt: Attempt) -> Result<(), TransportError> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            return Ok(());
        }

        if !self.connected() {
            self.set_state(ConnectionState::Connecting);
            let resume_from = self.height();

            let outcome = tokio::select! {
                res = self.transport.connect(resume_from) => Some(res),
                _ = stop.wait_for(|stopped| *stopped) => None,
            };
            let start = match outcome {
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    // connect may have completed its handshake before being dropped
                    if let Err(err) = self.transport.disconnect().await {
                        tracing::warn!(
                            transport = self.transport.name(),
                            error = %err,
                            "error closing connection interrupted by disconnect"
                        );
                    }
                    return Ok(());
                }
                Some(Err(err)) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(err);
                }
                Some(Ok(start)) => start,
            };

            *self.height.lock().unwrap() = start;
            self.connected.store(true, Ordering::SeqCst);
            self.set_state(ConnectionState::Connected);
            self.sink.add_event(QueueItem::connected());
            tracing::info!(transport = self.transport.name(), height = ?start, "connected");
            attempt.success();
        }

        self.set_state(ConnectionState::Listening);
        let emitter = BlockEmitter::new(&self.height, self.sink.as_ref());
        let outcome = tokio::select! {
            res = self.transport.listen_once(&emitter) => Some(res),
            _ = stop.wait_for(|stopped| *stopped) => None,
        };

        // disconnect() owns teardown once stop is set
        let Some(result) = outcome else {
            return Ok(());
        };
        if self.stopped() {
            return Ok(());
        }

        match result {
            Ok(()) => {
                tracing::warn!(transport = self.transport.name(), "connection closed by remote");
                self.mark_disconnected().await;
                Err(TransportError::ClosedByRemote)
            }
            Err(err) => {
                self.mark_disconnected().await;
                Err(err)
            }
        }
    }

    async fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.transport.disconnect().await {
                tracing::debug!(error = %err, "error closing dropped connection");
            }
            self.sink.add_event(QueueItem::disconnected());
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Stop listening and close the transport. Idempotent; the disconnect
    /// event is only queued if the client was connected.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop.send_replace(true);
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        if !was_connected {
            return Ok(());
        }

        let result = self.transport.disconnect().await;
        self.sink.add_event(QueueItem::disconnected());
        tracing::info!(transport = self.transport.name(), "disconnected");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use cometindex_core::queue::EventQueue;

    /// Each `listen_once` call plays the next script entry.
    struct ScriptedTransport {
        connects: Mutex<VecDeque<Result<Option<u64>, TransportError>>>,
        sessions: Mutex<VecDeque<(Vec<u64>, Result<(), TransportError>)>>,
        connect_calls: Arc<Mutex<Vec<Option<u64>>>>,
    }

    impl ScriptedTransport {
        fn new(
            connects: Vec<Result<Option<u64>, TransportError>>,
            sessions: Vec<(Vec<u64>, Result<(), TransportError>)>,
        ) -> Self {
            Self {
                connects: Mutex::new(connects.into()),
                sessions: Mutex::new(sessions.into()),
                connect_calls: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn connect(&self, resume_from: Option<u64>) -> Result<Option<u64>, TransportError> {
            self.connect_calls.lock().unwrap().push(resume_from);
            self.connects
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(resume_from))
        }

        async fn listen_once(&self, blocks: &BlockEmitter<'_>) -> Result<(), TransportError> {
            let next = self.sessions.lock().unwrap().pop_front();
            match next {
                Some((heights, result)) => {
                    for h in heights {
                        blocks.emit(h);
                    }
                    result
                }
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn drain(queue: &EventQueue) -> Vec<QueueItem> {
        std::iter::from_fn(|| queue.pop()).collect()
    }

    fn dropped() -> TransportError {
        TransportError::Closed {
            code: 1006,
            reason: "abnormal".into(),
        }
    }

    #[tokio::test]
    async fn reconnects_and_resumes_from_last_height() {
        let transport = ScriptedTransport::new(
            vec![
                Ok(Some(9)),
                Ok(Some(11)),
                Err(TransportError::InvalidStartHeight {
                    start: 13,
                    earliest: 100,
                    latest: 200,
                }),
            ],
            vec![(vec![10, 11], Err(dropped())), (vec![11, 12], Ok(()))],
        );
        let calls = transport.connect_calls.clone();
        let queue = Arc::new(EventQueue::new());
        let client = ConnectionClient::new(
            transport,
            Retrier::fixed(Duration::from_millis(1), Some(3)),
            queue.clone(),
        );

        // the clean close after 12 reconnects too; only the bad start height ends it
        let err = client.listen().await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidStartHeight { .. }));

        assert_eq!(*calls.lock().unwrap(), vec![None, Some(11), Some(12)]);
        assert_eq!(
            drain(&queue),
            vec![
                QueueItem::connected(),
                QueueItem::new_block(10),
                QueueItem::new_block(11),
                QueueItem::disconnected(),
                QueueItem::connected(),
                QueueItem::new_block(12),
                QueueItem::disconnected(),
            ]
        );
        assert!(!client.connected());
        assert_eq!(client.height(), Some(12));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let transport = ScriptedTransport::new(
            vec![
                Err(TransportError::WebSocket("refused".into())),
                Err(TransportError::WebSocket("refused".into())),
                Err(TransportError::WebSocket("refused".into())),
            ],
            vec![],
        );
        let calls = transport.connect_calls.clone();
        let queue = Arc::new(EventQueue::new());
        let client = ConnectionClient::new(
            transport,
            Retrier::fixed(Duration::from_millis(1), Some(2)),
            queue.clone(),
        );

        let err = client.listen().await.unwrap_err();
        assert!(matches!(err, TransportError::WebSocket(_)));
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn invalid_start_height_is_not_retried() {
        let transport = ScriptedTransport::new(
            vec![Err(TransportError::InvalidStartHeight {
                start: 1,
                earliest: 100,
                latest: 200,
            })],
            vec![],
        );
        let calls = transport.connect_calls.clone();
        let client = ConnectionClient::new(
            transport,
            Retrier::fixed(Duration::from_millis(1), None),
            Arc::new(EventQueue::new()),
        );

        let err = client.listen().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_stops_listening() {
        let transport = ScriptedTransport::new(vec![Ok(Some(4))], vec![(vec![5], Err(dropped()))]);
        let queue = Arc::new(EventQueue::new());
        let client = Arc::new(ConnectionClient::new(
            transport,
            Retrier::fixed(Duration::from_millis(1), None),
            queue.clone(),
        ));

        let listener = {
            let client = client.clone();
            tokio::spawn(async move { client.listen().await })
        };

        // second session parks forever until disconnect
        while !(client.connected() && client.state() == ConnectionState::Listening && queue.len() >= 4) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        listener.await.unwrap().unwrap();

        assert_eq!(
            drain(&queue),
            vec![
                QueueItem::connected(),
                QueueItem::new_block(5),
                QueueItem::disconnected(),
                QueueItem::connected(),
                QueueItem::disconnected(),
            ]
        );
    }

    #[tokio::test]
    async fn remote_close_keeps_listening_until_disconnect() {
        let transport = ScriptedTransport::new(vec![Ok(Some(4))], vec![(vec![5], Ok(()))]);
        let calls = transport.connect_calls.clone();
        let queue = Arc::new(EventQueue::new());
        let client = Arc::new(ConnectionClient::new(
            transport,
            Retrier::fixed(Duration::from_millis(1), Some(1)),
            queue.clone(),
        ));

        let listener = {
            let client = client.clone();
            tokio::spawn(async move { client.listen().await })
        };

        while !(client.connected() && client.state() == ConnectionState::Listening && queue.len() >= 4) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!listener.is_finished());
        assert_eq!(*calls.lock().unwrap(), vec![None, Some(5)]);

        client.disconnect().await.unwrap();
        listener.await.unwrap().unwrap();

        assert_eq!(
            drain(&queue),
            vec![
                QueueItem::connected(),
                QueueItem::new_block(5),
                QueueItem::disconnected(),
                QueueItem::connected(),
                QueueItem::disconnected(),
            ]
        );
    }

    #[test]
    fn emitter_drops_stale_heights() {
        let queue = EventQueue::new();
        let height = Mutex::new(Some(10));
        let emitter = BlockEmitter::new(&height, &queue);

        assert!(!emitter.emit(9));
        assert!(!emitter.emit(10));
        assert!(emitter.emit(11));
        assert_eq!(emitter.height(), Some(11));
        assert_eq!(drain(&queue), vec![QueueItem::new_block(11)]);
    }
}
