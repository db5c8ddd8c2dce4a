//! A [`Transport`] over WebSocket with JSON text frames.
//!
//! ## Protocol
//!
//! Every frame is a JSON object tagged by `type`.
//!
//! - The session opens with `hello`, carrying the [`CallManifest`](crate::registry::CallManifest)
//!   list, and waits for `ready` (or `rejected`).
//! - Calls are sent as `invoke` with a per-connection `id`; the peer answers with `response` or
//!   `failure` carrying the same `id`, in any order.
//! - Events arrive unsolicited as `event` with a `name` and `payload`.
//!
//! ## Tasks
//!
//! An established connection runs two tasks. The writer owns the sink and drains an outbound
//! queue. The reader routes responses to waiting callers and events to registered handlers.
//! When the socket closes, pending calls fail with [`TransportError::Closed`] and all handlers
//! are dropped, which ends every subscription stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::registry::CallRegistry;
use crate::subscription::SubscriptionId;
use crate::transport::{Connection, EventHandler, Handshake, Transport, TransportError};

use self::frame::{ClientFrame, ServerFrame};

mod frame;

/// Opens [`WsConnection`]s with `tokio-tungstenite`.
///
/// `wss` endpoints need a TLS backend; enable the `rustls` feature of this crate.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    type Connection = WsConnection;

    async fn connect(&self, handshake: Handshake) -> Result<WsConnection, TransportError> {
        debug!(endpoint = %handshake.endpoint, "Opening WebSocket");
        let (socket, _response) =
            tokio_tungstenite::connect_async(handshake.endpoint.as_str()).await?;

        WsConnection::establish(socket, &handshake.registry).await
    }
}

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, TransportError>>, ahash::RandomState>;
type HandlerMap = DashMap<String, Vec<(SubscriptionId, EventHandler)>, ahash::RandomState>;

/// State shared between a connection handle and its reader task.
struct Shared {
    pending: PendingMap,
    handlers: HandlerMap,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn route(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Dropping malformed frame");
                return;
            }
        };

        match frame {
            ServerFrame::Response { id, result } => self.complete(id, Ok(result)),
            ServerFrame::Failure { id, message } => {
                self.complete(id, Err(TransportError::Remote(message)))
            }
            ServerFrame::Event { name, payload } => match self.handlers.get(&name) {
                Some(handlers) => {
                    for (_, handler) in handlers.iter() {
                        handler(payload.clone());
                    }
                }
                None => debug!(name = %name, "Event without subscribers"),
            },
            ServerFrame::Ready | ServerFrame::Rejected { .. } => {
                warn!("Unexpected handshake frame on established connection");
            }
        }
    }

    fn complete(&self, id: u64, result: Result<Value, TransportError>) {
        match self.pending.remove(&id) {
            // The caller may have stopped waiting.
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => debug!(id = id, "Response for unknown request"),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                pending = self.pending.len(),
                "WebSocket connection closed"
            );
        }
        self.pending.clear();
        self.handlers.clear();
    }
}

/// An established WebSocket connection.
pub struct WsConnection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl WsConnection {
    /// Perform the handshake on an open socket and start the connection tasks.
    pub async fn establish<S>(
        socket: WebSocketStream<S>,
        registry: &CallRegistry,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();

        let hello = ClientFrame::Hello {
            contract: registry.manifest(),
        };
        sink.send(Message::Text(serde_json::to_string(&hello)?.into()))
            .await?;

        wait_for_ready(&mut stream).await?;
        debug!(calls = registry.len(), "Handshake accepted");

        Ok(Self::spawn(sink, stream))
    }

    fn spawn<S>(
        sink: SplitSink<WebSocketStream<S>, Message>,
        stream: SplitStream<WebSocketStream<S>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: DashMap::default(),
            handlers: DashMap::default(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, queue, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        Self {
            shared,
            outbound,
            reader,
        }
    }
}

impl Connection for WsConnection {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&ClientFrame::Invoke { id, name, args })?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _pending = PendingGuard {
            shared: &self.shared,
            id,
        };

        // The reader marks the connection closed before it drops pending requests.
        if self.is_closed() || self.outbound.send(Message::Text(text.into())).is_err() {
            return Err(TransportError::Closed);
        }

        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn on(&self, name: &str, id: SubscriptionId, handler: EventHandler) {
        self.shared
            .handlers
            .entry(name.to_string())
            .or_default()
            .push((id.clone(), handler));

        // `close` flags the connection before it clears the table, so a late insert is seen here.
        if self.is_closed() {
            debug!(name = %name, "Dropping handler registered on a closed connection");
            self.off(name, &id);
        }
    }

    fn off(&self, name: &str, id: &SubscriptionId) {
        if let Some(mut handlers) = self.shared.handlers.get_mut(name) {
            handlers.retain(|(registered, _)| registered != id);
        }
        self.shared
            .handlers
            .remove_if(name, |_, handlers| handlers.is_empty());
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Forgets a request whose caller stopped waiting before the peer answered.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        // Dropping `outbound` ends the writer, which closes the socket.
        self.reader.abort();
        self.shared.close();
    }
}

async fn wait_for_ready<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                return match serde_json::from_str::<ServerFrame>(text.as_str())? {
                    ServerFrame::Ready => Ok(()),
                    ServerFrame::Rejected { reason } => Err(TransportError::Rejected(reason)),
                    other => Err(TransportError::Protocol(format!(
                        "expected ready, got {other:?}"
                    ))),
                };
            }
            Message::Close(_) => return Err(TransportError::Closed),
            _ => continue,
        }
    }

    Err(TransportError::Closed)
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        if let Err(err) = sink.send(message).await {
            warn!(error = %err, "WebSocket send failed");
            shared.close();
            return;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => shared.route(text.as_str()),
            Ok(Message::Close(frame)) => {
                debug!(frame = ?frame, "Peer closed WebSocket");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "WebSocket receive failed");
                break;
            }
        }
    }

    shared.close();
}
