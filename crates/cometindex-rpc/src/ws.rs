//! WebSocket transport: subscribes to `NewBlock` events on `/websocket`.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::connection::{BlockEmitter, Transport};
use crate::error::TransportError;
use crate::http::parse_height;
use crate::request::{JsonRpcError, JsonRpcRequest, RpcId};

pub const NEW_BLOCK_QUERY: &str = "tm.event='NewBlock'";
pub const NEW_BLOCK_EVENT_TYPE: &str = "tendermint/event/NewBlock";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    jsonrpc: String,
    id: RpcId,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct WsEventResult {
    query: String,
    data: WsEventData,
    #[serde(default)]
    events: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WsEventData {
    #[serde(rename = "type")]
    kind: String,
    value: Value,
}

/// Height carried by a subscription message, `None` for messages without an
/// event (the subscribe confirmation).
pub fn parse_new_block(text: &str) -> Result<Option<u64>, TransportError> {
    let envelope: WsEnvelope = serde_json::from_str(text)?;
    if envelope.jsonrpc != "2.0" {
        return Err(TransportError::Protocol(format!(
            "unexpected jsonrpc version {:?}",
            envelope.jsonrpc
        )));
    }
    if let Some(err) = envelope.error {
        return Err(TransportError::Rpc(err));
    }

    let result = match envelope.result {
        Some(Value::Object(map)) if !map.is_empty() => Value::Object(map),
        _ => return Ok(None),
    };

    let event: WsEventResult = serde_json::from_value(result)?;
    if event.data.kind != NEW_BLOCK_EVENT_TYPE {
        return Err(TransportError::Protocol(format!(
            "unexpected event type {:?} for query {:?}",
            event.data.kind, event.query
        )));
    }

    let height = event
        .data
        .value
        .pointer("/block/header/height")
        .and_then(parse_height)
        .ok_or_else(|| TransportError::Protocol("NewBlock event without header height".into()))?;

    tracing::trace!(id = %envelope.id, height, events = event.events.len(), "NewBlock");
    Ok(Some(height))
}

fn is_clean_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Away)
}

/// Live transport over the node's WebSocket endpoint.
pub struct WsTransport {
    url: String,
    socket: Mutex<Option<WsStream>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").field("url", &self.url).finish()
    }
}

impl WsTransport {
    /// `url` is the full endpoint, e.g. `ws://localhost:26657/websocket`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, resume_from: Option<u64>) -> Result<Option<u64>, TransportError> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(format!("connect {}: {e}", self.url)))?;

        let subscribe = JsonRpcRequest::new(1, "subscribe", json!({ "query": NEW_BLOCK_QUERY }));
        let text = serde_json::to_string(&subscribe)?;
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::WebSocket(format!("subscribe: {e}")))?;

        tracing::debug!(url = %self.url, "subscribed to NewBlock");
        *self.socket.lock().await = Some(ws);
        // the node pushes only new blocks, so keep the previous position
        Ok(resume_from)
    }

    async fn listen_once(&self, blocks: &BlockEmitter<'_>) -> Result<(), TransportError> {
        let mut guard = self.socket.lock().await;
        let ws = guard
            .as_mut()
            .ok_or_else(|| TransportError::WebSocket("not connected".into()))?;

        loop {
            let msg = match ws.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                None => return Err(TransportError::WebSocket("stream ended without close frame".into())),
            };

            match msg {
                Message::Text(text) => match parse_new_block(text.as_str()) {
                    Ok(Some(height)) => {
                        blocks.emit(height);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "ignoring unexpected message");
                    }
                },
                Message::Close(frame) => {
                    return match frame {
                        Some(f) if is_clean_close(f.code) => Ok(()),
                        Some(f) => Err(TransportError::Closed {
                            code: u16::from(f.code),
                            reason: f.reason.to_string(),
                        }),
                        None => Err(TransportError::Closed {
                            code: 1005,
                            reason: "no status".into(),
                        }),
                    };
                }
                // pings are answered by tungstenite
                _ => {}
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut ws) = self.socket.lock().await.take() else {
            return Ok(());
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            tracing::debug!(error = %e, "close handshake failed");
        }
        Ok(())
    }
}
