//! Scripted in-memory transport used by the unit tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{Notify, watch};

use crate::session::Endpoint;
use crate::subscription::SubscriptionId;
use crate::transport::{Connection, EventHandler, Handshake, Transport, TransportError};

type Responder = dyn Fn(&str, Value) -> Result<Value, TransportError> + Send + Sync;

pub(crate) fn endpoint() -> Endpoint {
    Endpoint::parse("ws://mock.test/rpc").unwrap()
}

/// Keeps connection attempts suspended until [`release`](Self::release) is called.
pub(crate) struct ConnectGate {
    open: watch::Sender<bool>,
}

impl ConnectGate {
    pub(crate) fn release(&self) {
        self.open.send_replace(true);
    }
}

pub(crate) struct MockTransport {
    connects: AtomicUsize,
    connect_notify: Notify,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    fail_next: Mutex<Option<String>>,
    responder: Arc<Responder>,
    handshakes: Mutex<Vec<Handshake>>,
    connections: Mutex<Vec<MockConnection>>,
}

impl MockTransport {
    /// A transport whose connections answer every call with its own arguments.
    pub(crate) fn new() -> Self {
        Self::with_responder(|_, args| Ok(args))
    }

    pub(crate) fn with_responder(
        responder: impl Fn(&str, Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            connect_notify: Notify::new(),
            gate: Mutex::new(None),
            fail_next: Mutex::new(None),
            responder: Arc::new(responder),
            handshakes: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn hold_connects(&self) -> ConnectGate {
        let (open, receiver) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(receiver);
        ConnectGate { open }
    }

    pub(crate) fn fail_next_connect(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` connection attempts have started.
    pub(crate) async fn wait_for_connects(&self, count: usize) {
        loop {
            let notified = self.connect_notify.notified();
            if self.connect_count() >= count {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }

    /// Number of attempts that produced a connection.
    pub(crate) fn established_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// The connection produced by the `index`-th successful attempt.
    pub(crate) fn connection(&self, index: usize) -> MockConnection {
        self.connections.lock().unwrap()[index].clone()
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, handshake: Handshake) -> Result<MockConnection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_notify.notify_waiters();
        self.handshakes.lock().unwrap().push(handshake);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(mut gate) = gate {
            let opened = gate.wait_for(|open| *open).await.is_ok();
            // A dropped gate never opens.
            if !opened {
                std::future::pending::<()>().await;
            }
        }

        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(TransportError::Rejected(reason));
        }

        let connection = MockConnection::new(Arc::clone(&self.responder));
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Clone)]
pub(crate) struct MockConnection {
    inner: Arc<MockConnectionInner>,
}

struct MockConnectionInner {
    responder: Arc<Responder>,
    invocations: Mutex<Vec<(String, Value)>>,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, EventHandler)>>>,
    closed: AtomicBool,
}

impl MockConnection {
    fn new(responder: Arc<Responder>) -> Self {
        Self {
            inner: Arc::new(MockConnectionInner {
                responder,
                invocations: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Push a raw payload for `name` to every registered handler.
    pub(crate) fn emit(&self, name: &str, payload: Value) {
        let handlers = self.inner.handlers.lock().unwrap();
        for (_, handler) in handlers.get(name).into_iter().flatten() {
            handler(payload.clone());
        }
    }

    /// Mark the connection closed and drop every handler.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.handlers.lock().unwrap().clear();
    }

    pub(crate) fn handler_count(&self, name: &str) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, Vec::len)
    }

    pub(crate) fn invocations(&self) -> Vec<(String, Value)> {
        self.inner.invocations.lock().unwrap().clone()
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection for MockConnection {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.inner
            .invocations
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        (self.inner.responder)(name, args)
    }

    fn on(&self, name: &str, id: SubscriptionId, handler: EventHandler) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
    }

    fn off(&self, name: &str, id: &SubscriptionId) {
        if let Some(handlers) = self.inner.handlers.lock().unwrap().get_mut(name) {
            handlers.retain(|(registered, _)| registered != id);
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
