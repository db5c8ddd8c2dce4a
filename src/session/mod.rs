//! The session facade: one configured client binding owning at most one connection.
//!
//! ```ignore
//! let registry = CallRegistry::builder()
//!     .invokable::<Echo>()
//!     .event::<Ticks>()
//!     .build()?;
//!
//! let config = SessionConfig::builder()
//!     .endpoint("ws://localhost:9000/rpc".parse()?)
//!     .registry(registry)
//!     .build();
//!
//! let session = Session::new(config, WsTransport::new());
//!
//! let length = session.invoke::<Echo>("hi".to_string()).await?;
//!
//! let mut ticks = session.subscribe::<Ticks>()?;
//! while let Some(tick) = ticks.next().await {
//!     println!("{:?}", tick?);
//! }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatch::InvocationDispatcher;
use crate::error::SessionError;
use crate::registry::{CallRegistry, Event, Invokable, ValidationError};
use crate::subscription::{Subscription, SubscriptionMultiplexer};
use crate::transport::Transport;

pub use self::cache_key::CacheKey;
pub use self::config::{Endpoint, InvalidEndpoint, SessionConfig};

mod cache_key;
mod config;

/// A configured RPC client binding.
///
/// Cloning is cheap and every clone shares the same connection.
pub struct Session<T: Transport> {
    registry: Arc<CallRegistry>,
    connections: Arc<ConnectionManager<T>>,
    dispatcher: InvocationDispatcher<T>,
    multiplexer: SubscriptionMultiplexer<T>,
}

impl<T: Transport> Session<T> {
    /// Create a session. No connection is opened until the first call or subscription needs one.
    pub fn new(config: SessionConfig, transport: T) -> Self {
        let SessionConfig {
            endpoint,
            registry,
            handshake_timeout,
            reestablish_closed,
        } = config;

        info!(
            endpoint = %endpoint,
            calls = registry.len(),
            "Session created"
        );

        let registry = Arc::new(registry);
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(transport),
            endpoint,
            Arc::clone(&registry),
            handshake_timeout,
            reestablish_closed,
        ));

        Self {
            dispatcher: InvocationDispatcher::new(Arc::clone(&registry), Arc::clone(&connections)),
            multiplexer: SubscriptionMultiplexer::new(
                Arc::clone(&registry),
                Arc::clone(&connections),
            ),
            registry,
            connections,
        }
    }

    /// Call the invokable `I` and wait for its result.
    pub async fn invoke<I: Invokable>(&self, args: I::Args) -> Result<I::Returns, SessionError> {
        self.dispatcher.invoke::<I>(args).await
    }

    /// Call an invokable by name with JSON arguments, validated against its declared shape.
    pub async fn invoke_raw(&self, name: &str, args: Value) -> Result<Value, SessionError> {
        self.dispatcher.invoke_raw(name, args).await
    }

    /// Subscribe to the event `E`.
    pub fn subscribe<E: Event>(&self) -> Result<Subscription<E::Payload>, SessionError> {
        self.multiplexer.subscribe::<E>()
    }

    /// Subscribe to an event by name, yielding validated JSON payloads.
    pub fn subscribe_raw(&self, name: &str) -> Result<Subscription<Value>, SessionError> {
        self.multiplexer.subscribe_raw(name)
    }

    /// The cache key of calling `I` with `args`.
    pub fn invoke_key<I: Invokable>(&self, args: &I::Args) -> Result<CacheKey, SessionError> {
        self.registry.invokable_of::<I>()?;
        let args = ValidationError::encode(args)?;
        Ok(invoke_key(I::NAME, &args))
    }

    /// The cache key of a subscription to `E`.
    pub fn subscription_key<E: Event>(&self) -> Result<CacheKey, SessionError> {
        self.registry.event_of::<E>()?;
        Ok(CacheKey::Subscription {
            name: E::NAME.into(),
        })
    }

    /// A keyed, repeatable producer for calling `I` with fixed arguments.
    pub fn query<I: Invokable>(&self, args: &I::Args) -> Result<Query<I, T>, SessionError> {
        self.registry.invokable_of::<I>()?;
        let args = ValidationError::encode(args)?;

        Ok(Query {
            key: invoke_key(I::NAME, &args),
            args,
            dispatcher: self.dispatcher.clone(),
            _call: PhantomData,
        })
    }

    /// A producer for calling `I` with arguments supplied at trigger time.
    pub fn mutation<I: Invokable>(&self) -> Result<Mutation<I, T>, SessionError> {
        self.registry.invokable_of::<I>()?;

        Ok(Mutation {
            key: CacheKey::Mutation {
                name: I::NAME.into(),
            },
            dispatcher: self.dispatcher.clone(),
            _call: PhantomData,
        })
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.connections.endpoint()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    /// Forget the current connection; the next call establishes a new one.
    pub fn invalidate(&self) {
        self.connections.invalidate();
    }
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&self.connections),
            dispatcher: self.dispatcher.clone(),
            multiplexer: self.multiplexer.clone(),
        }
    }
}

fn invoke_key(name: &'static str, args: &Value) -> CacheKey {
    CacheKey::Invoke {
        name: name.into(),
        args: args.to_string().into(),
    }
}

/// A call to `I` with fixed arguments, ready to be driven by a request cache.
pub struct Query<I: Invokable, T: Transport> {
    key: CacheKey,
    args: Value,
    dispatcher: InvocationDispatcher<T>,
    _call: PhantomData<fn() -> I>,
}

impl<I: Invokable, T: Transport> Query<I, T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Perform the call once. Every invocation is a new remote call.
    pub async fn fetch(&self) -> Result<I::Returns, SessionError> {
        self.dispatcher.invoke_encoded::<I>(self.args.clone()).await
    }
}

impl<I: Invokable, T: Transport> Clone for Query<I, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            args: self.args.clone(),
            dispatcher: self.dispatcher.clone(),
            _call: PhantomData,
        }
    }
}

/// A call to `I` whose arguments are supplied when it is triggered.
pub struct Mutation<I: Invokable, T: Transport> {
    key: CacheKey,
    dispatcher: InvocationDispatcher<T>,
    _call: PhantomData<fn() -> I>,
}

impl<I: Invokable, T: Transport> Mutation<I, T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub async fn trigger(&self, args: I::Args) -> Result<I::Returns, SessionError> {
        self.dispatcher.invoke::<I>(args).await
    }
}

impl<I: Invokable, T: Transport> Clone for Mutation<I, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            dispatcher: self.dispatcher.clone(),
            _call: PhantomData,
        }
    }
}
