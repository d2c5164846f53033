//! cometindex-rpc: talking to CometBFT nodes.
//!
//! - [`CometHttpClient`]: retried JSON-RPC over HTTP; implements `BlockSource`
//! - [`ConnectionClient`]: keeps a live [`Transport`] connected and queues heights
//! - [`WsTransport`] / [`HttpPollTransport`]: the two live transports

pub mod connection;
pub mod error;
pub mod http;
pub mod poll;
pub mod request;
pub mod ws;

pub use connection::{BlockEmitter, ConnectionClient, ConnectionState, Transport};
pub use error::TransportError;
pub use http::{CometHttpClient, HttpClientConfig};
pub use poll::HttpPollTransport;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use ws::WsTransport;
