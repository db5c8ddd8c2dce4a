//! The contract between a session and the duplex channel it runs over.
//!
//! A [`Transport`] knows how to open a [`Connection`] to an endpoint. The connection carries
//! request/response calls and pushes named events to registered handlers. Framing, correlation
//! of responses to requests and detection of a lost peer all belong to the implementation.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::registry::CallRegistry;
use crate::session::Endpoint;
use crate::subscription::SubscriptionId;

/// Callback invoked by a connection for every raw payload of the event it was registered for.
pub type EventHandler = Box<dyn Fn(Value) + Send + Sync>;

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub endpoint: Endpoint,
    /// The full contract, so both peers agree on names and shapes.
    pub registry: Arc<CallRegistry>,
}

/// Opens connections to a remote peer.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Create the underlying channel and perform the handshake.
    fn connect(
        &self,
        handshake: Handshake,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// A single established duplex channel.
pub trait Connection: Send + Sync + 'static {
    /// Send the call `name` with `args` and wait for the remote result.
    fn invoke(
        &self,
        name: &str,
        args: Value,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Register `handler` for every payload of the event `name` under `id`.
    fn on(&self, name: &str, id: SubscriptionId, handler: EventHandler);

    /// Remove the handler registered for `name` under `id`, if any.
    fn off(&self, name: &str, id: &SubscriptionId);

    /// Whether the channel has been closed by either side.
    ///
    /// Implementations that cannot tell keep the default.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Errors raised while talking to the remote peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    Closed,

    /// The remote peer failed the call.
    #[error("remote error: {0}")]
    Remote(String),

    /// The remote peer refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The remote peer sent something the protocol does not allow at this point.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An error from the underlying WebSocket.
    #[error("websocket error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be encoded or decoded.
    #[error("malformed frame")]
    Frame(#[from] serde_json::Error),

    /// The handshake did not complete in time.
    #[error("timeout waiting for handshake")]
    Timeout(#[from] tokio::time::error::Elapsed),
}
