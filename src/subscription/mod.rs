//! Event subscriptions multiplexed over the shared connection.
//!
//! Each [`Subscription`] owns one handler registration on the connection. Payloads are validated
//! against the registered schema before they reach the subscriber, and dropping the subscription
//! removes its handler without closing the connection.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::error::SessionError;
use crate::registry::{CallRegistry, Event, Schema, ValidationError};
use crate::transport::{Connection, Transport, TransportError};

pub use self::id::SubscriptionId;

mod id;

/// Registers per-subscriber handlers for named events.
pub struct SubscriptionMultiplexer<T: Transport> {
    registry: Arc<CallRegistry>,
    connections: Arc<ConnectionManager<T>>,
}

impl<T: Transport> SubscriptionMultiplexer<T> {
    pub fn new(registry: Arc<CallRegistry>, connections: Arc<ConnectionManager<T>>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Subscribe to the event `E`, yielding decoded payloads.
    pub fn subscribe<E: Event>(&self) -> Result<Subscription<E::Payload>, SessionError> {
        self.registry.event_of::<E>()?;
        let raw = self.subscribe_raw(E::NAME)?;
        let id = raw.id.clone();
        let stream = raw
            .map(|item| {
                item.and_then(|value| {
                    ValidationError::decode::<E::Payload>(value).map_err(SessionError::from)
                })
            })
            .boxed();

        Ok(Subscription::new(id, E::NAME, stream))
    }

    /// Subscribe to an event by its registered name, yielding validated JSON payloads.
    ///
    /// The name is checked immediately. The connection is only requested once the subscription
    /// is first polled.
    pub fn subscribe_raw(&self, name: &str) -> Result<Subscription<Value>, SessionError> {
        let schema = self.registry.event(name)?.output;
        let id = SubscriptionId::generate();
        let stream = activate(
            Arc::clone(&self.connections),
            name.to_string(),
            id.clone(),
            schema,
        );

        Ok(Subscription::new(id, name, stream))
    }
}

impl<T: Transport> Clone for SubscriptionMultiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&self.connections),
        }
    }
}

fn activate<T: Transport>(
    connections: Arc<ConnectionManager<T>>,
    name: String,
    id: SubscriptionId,
    schema: Schema,
) -> BoxStream<'static, Result<Value, SessionError>> {
    async_stream::stream! {
        let connection = match connections.ensure().await {
            Ok(connection) => connection,
            Err(err) => {
                yield Err(err);
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler_name = name.clone();
        connection.on(
            &name,
            id.clone(),
            Box::new(move |raw: Value| {
                let item = schema.validate(&raw);
                if let Err(err) = &item {
                    debug!(name = %handler_name, error = %err, "Rejected event payload");
                }
                // The receiver is gone once the subscriber stopped listening.
                let _ = tx.send(item);
            }),
        );
        info!(name = %name, subscription_id = %id, "Subscribed to event");

        let registration = Registration {
            connection: Arc::clone(&connection),
            name,
            id,
        };

        // A connection closed before `on` has already dropped its handlers.
        if connection.is_closed() {
            debug!(
                name = %registration.name,
                subscription_id = %registration.id,
                "Subscribed on a closed connection"
            );
            yield Err(SessionError::from(TransportError::Closed));
            return;
        }

        while let Some(item) = rx.recv().await {
            yield item.map_err(SessionError::from);
        }

        if connection.is_closed() {
            debug!(
                name = %registration.name,
                subscription_id = %registration.id,
                "Connection closed under subscription"
            );
            yield Err(SessionError::from(TransportError::Closed));
        }
    }
    .boxed()
}

/// Removes a handler from its connection when dropped.
struct Registration<C: Connection> {
    connection: Arc<C>,
    name: String,
    id: SubscriptionId,
}

impl<C: Connection> Drop for Registration<C> {
    fn drop(&mut self) {
        self.connection.off(&self.name, &self.id);
        info!(name = %self.name, subscription_id = %self.id, "Unsubscribed from event");
    }
}

/// A lazily activated stream of validated payloads for one event.
///
/// Invalid payloads arrive as [`SessionError::Validation`] items and do not end the stream. The
/// stream ends after a connection failure has been yielded. Dropping it, or calling
/// [`unsubscribe`](Self::unsubscribe), removes the handler from the connection.
pub struct Subscription<P> {
    id: SubscriptionId,
    name: Arc<str>,
    inner: BoxStream<'static, Result<P, SessionError>>,
}

impl<P> Subscription<P> {
    fn new(
        id: SubscriptionId,
        name: impl Into<Arc<str>>,
        inner: BoxStream<'static, Result<P, SessionError>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            inner,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop listening and deregister the handler.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<P: Send + 'static> Subscription<P> {
    /// Drive the subscription on a background task, delivering items to callbacks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn into_handle<D, E>(mut self, on_data: D, on_error: E) -> SubscriptionHandle<P>
    where
        D: Fn(P) + Send + 'static,
        E: Fn(SessionError) + Send + 'static,
    {
        let id = self.id.clone();
        let name = Arc::clone(&self.name);

        let task = tokio::spawn(async move {
            while let Some(item) = self.next().await {
                match item {
                    Ok(payload) => on_data(payload),
                    Err(err) => on_error(err),
                }
            }
        });

        SubscriptionHandle {
            id,
            name,
            task,
            _payload: PhantomData,
        }
    }
}

impl<P> Stream for Subscription<P> {
    type Item = Result<P, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Callback form of a [`Subscription`] running on its own task.
pub struct SubscriptionHandle<P> {
    id: SubscriptionId,
    name: Arc<str>,
    task: JoinHandle<()>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> SubscriptionHandle<P> {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the underlying stream has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop delivery and deregister the handler.
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::test_support::{MockTransport, endpoint};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick {
        seq: u32,
    }

    struct Ticks;

    impl Event for Ticks {
        const NAME: &'static str = "ticks";
        type Payload = Tick;
    }

    struct Alerts;

    impl Event for Alerts {
        const NAME: &'static str = "alerts";
        type Payload = String;
    }

    struct Unregistered;

    impl Event for Unregistered {
        const NAME: &'static str = "unregistered";
        type Payload = ();
    }

    fn multiplexer() -> (Arc<MockTransport>, SubscriptionMultiplexer<MockTransport>) {
        multiplexer_with(true)
    }

    fn multiplexer_with(
        reestablish_closed: bool,
    ) -> (Arc<MockTransport>, SubscriptionMultiplexer<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let registry = Arc::new(
            CallRegistry::builder()
                .event::<Ticks>()
                .event::<Alerts>()
                .build()
                .unwrap(),
        );
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&transport),
            endpoint(),
            Arc::clone(&registry),
            Duration::from_secs(5),
            reestablish_closed,
        ));
        (transport, SubscriptionMultiplexer::new(registry, connections))
    }

    /// Poll the subscription until its handler is registered on the first connection.
    async fn activate_until_registered<P>(
        subscription: &mut Subscription<P>,
        transport: &MockTransport,
        name: &str,
        count: usize,
    ) {
        loop {
            let registered = transport.established_count() > 0
                && transport.connection(0).handler_count(name) >= count;
            if registered {
                return;
            }

            let poll = tokio::time::timeout(Duration::from_millis(5), subscription.next()).await;
            assert!(poll.is_err(), "subscription yielded before any event");
        }
    }

    #[tokio::test]
    async fn test_unknown_event_is_rejected_eagerly() {
        let (transport, multiplexer) = multiplexer();

        let err = multiplexer.subscribe::<Unregistered>().unwrap_err();
        assert!(matches!(err, SessionError::UnknownName(_)));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_activation_is_lazy() {
        let (transport, multiplexer) = multiplexer();

        let subscription = multiplexer.subscribe::<Ticks>().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(transport.connect_count(), 0);

        drop(subscription);
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_every_payload_in_order() {
        let (transport, multiplexer) = multiplexer();
        let mut first = multiplexer.subscribe::<Ticks>().unwrap();
        let mut second = multiplexer.subscribe::<Ticks>().unwrap();

        activate_until_registered(&mut first, &transport, "ticks", 1).await;
        activate_until_registered(&mut second, &transport, "ticks", 2).await;
        assert_eq!(transport.connect_count(), 1);

        let connection = transport.connection(0);
        for seq in 0..3 {
            connection.emit("ticks", json!({ "seq": seq }));
        }

        for subscription in [&mut first, &mut second] {
            for seq in 0..3 {
                let tick = subscription.next().await.unwrap().unwrap();
                assert_eq!(tick, Tick { seq });
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_other_subscribers() {
        let (transport, multiplexer) = multiplexer();
        let mut first = multiplexer.subscribe::<Ticks>().unwrap();
        let mut second = multiplexer.subscribe::<Ticks>().unwrap();

        activate_until_registered(&mut first, &transport, "ticks", 1).await;
        activate_until_registered(&mut second, &transport, "ticks", 2).await;

        let connection = transport.connection(0);
        first.unsubscribe();
        assert_eq!(connection.handler_count("ticks"), 1);
        assert!(!connection.is_closed());

        connection.emit("ticks", json!({ "seq": 7 }));
        assert_eq!(second.next().await.unwrap().unwrap(), Tick { seq: 7 });
    }

    #[tokio::test]
    async fn test_invalid_payload_is_delivered_as_error() {
        let (transport, multiplexer) = multiplexer();
        let mut ticks = multiplexer.subscribe::<Ticks>().unwrap();
        let mut alerts = multiplexer.subscribe::<Alerts>().unwrap();

        activate_until_registered(&mut ticks, &transport, "ticks", 1).await;
        activate_until_registered(&mut alerts, &transport, "alerts", 1).await;

        let connection = transport.connection(0);
        connection.emit("ticks", json!({ "seq": "seven" }));
        connection.emit("ticks", json!({ "seq": 8 }));
        connection.emit("alerts", json!("low battery"));

        let err = ticks.next().await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(ticks.next().await.unwrap().unwrap(), Tick { seq: 8 });

        // The other event name only sees its own payload.
        assert_eq!(alerts.next().await.unwrap().unwrap(), "low battery");
    }

    #[tokio::test]
    async fn test_establishment_failure_ends_subscription() {
        let (transport, multiplexer) = multiplexer();
        transport.fail_next_connect("refused");

        let mut subscription = multiplexer.subscribe::<Ticks>().unwrap();
        let err = subscription.next().await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectionEstablishment(_)));
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_close_ends_subscription() {
        let (transport, multiplexer) = multiplexer();
        let mut subscription = multiplexer.subscribe::<Ticks>().unwrap();
        activate_until_registered(&mut subscription, &transport, "ticks", 1).await;

        transport.connection(0).close();

        let err = subscription.next().await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribing_on_closed_connection_ends_at_once() {
        let (transport, multiplexer) = multiplexer_with(false);
        let mut first = multiplexer.subscribe::<Ticks>().unwrap();
        activate_until_registered(&mut first, &transport, "ticks", 1).await;

        let connection = transport.connection(0);
        connection.close();

        // The cached connection is handed out again without a liveness check.
        let mut late = multiplexer.subscribe::<Ticks>().unwrap();
        let item = tokio::time::timeout(Duration::from_millis(300), late.next())
            .await
            .expect("subscription on a closed connection must not hang");
        assert!(matches!(
            item,
            Some(Err(SessionError::Transport(TransportError::Closed)))
        ));
        assert!(late.next().await.is_none());

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(connection.handler_count("ticks"), 0);
    }

    #[tokio::test]
    async fn test_handle_delivers_to_callbacks_until_unsubscribed() {
        let (transport, multiplexer) = multiplexer();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let sink = Arc::clone(&received);
        let handle = multiplexer.subscribe::<Alerts>().unwrap().into_handle(
            move |alert| {
                sink.lock().unwrap().push(alert);
                let _ = seen_tx.send(());
            },
            |err| panic!("unexpected error: {err}"),
        );

        transport.wait_for_connects(1).await;
        while transport.established_count() == 0 {
            tokio::task::yield_now().await;
        }
        let connection = transport.connection(0);
        while connection.handler_count("alerts") == 0 {
            tokio::task::yield_now().await;
        }

        connection.emit("alerts", json!("one"));
        seen_rx.recv().await.unwrap();
        assert_eq!(*received.lock().unwrap(), vec!["one".to_string()]);

        handle.unsubscribe();
        while connection.handler_count("alerts") != 0 {
            tokio::task::yield_now().await;
        }
    }
}
