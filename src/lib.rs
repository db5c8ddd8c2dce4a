//! Client-side RPC session management.
//!
//! A [`Session`] binds a [`CallRegistry`] of named calls and events to one remote endpoint. The
//! connection is opened lazily on first use and shared by every call and subscription; concurrent
//! first callers wait on a single handshake. Arguments, results and event payloads are validated
//! against the registered types on the way in and out.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::InvocationDispatcher;
pub use error::SessionError;
pub use registry::error::{DuplicateName, SchemaMismatch, UnknownName};
pub use registry::{
    CallKind, CallManifest, CallRegistry, CallRegistryBuilder, CallSchema, Event, Invokable,
    Schema, ValidationError,
};
pub use session::{CacheKey, Endpoint, InvalidEndpoint, Mutation, Query, Session, SessionConfig};
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionId, SubscriptionMultiplexer};
pub use transport::{Connection, EventHandler, Handshake, Transport, TransportError};
pub use ws::{WsConnection, WsTransport};
