//! Lazy, single-flight ownership of the one connection a session runs over.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::registry::CallRegistry;
use crate::session::Endpoint;
use crate::transport::{Connection, Handshake, Transport, TransportError};

type EstablishFuture<C> = Shared<BoxFuture<'static, Result<Arc<C>, Arc<TransportError>>>>;

/// Observable lifecycle of the connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Pending,
    Established,
}

enum Slot<C> {
    Absent,
    /// An establishment attempt is in flight; every caller awaits the same shared future.
    Pending {
        attempt: u64,
        future: EstablishFuture<C>,
    },
    Established(Arc<C>),
}

struct State<C> {
    slot: Slot<C>,
    attempts: u64,
}

/// Owns at most one connection and creates it on first use.
///
/// Concurrent callers that find no connection share a single establishment attempt. A failed
/// attempt clears the slot so the next caller starts over; nothing is retried automatically.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    endpoint: Endpoint,
    registry: Arc<CallRegistry>,
    handshake_timeout: Duration,
    reestablish_closed: bool,
    state: Mutex<State<T::Connection>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: Arc<T>,
        endpoint: Endpoint,
        registry: Arc<CallRegistry>,
        handshake_timeout: Duration,
        reestablish_closed: bool,
    ) -> Self {
        Self {
            transport,
            endpoint,
            registry,
            handshake_timeout,
            reestablish_closed,
            state: Mutex::new(State {
                slot: Slot::Absent,
                attempts: 0,
            }),
        }
    }

    /// Return the established connection, creating it if needed.
    pub async fn ensure(&self) -> Result<Arc<T::Connection>, SessionError> {
        let (attempt, future) = {
            let mut state = self.lock_state();

            if let Slot::Established(connection) = &state.slot {
                if !(self.reestablish_closed && connection.is_closed()) {
                    return Ok(Arc::clone(connection));
                }

                warn!(
                    endpoint = %self.endpoint,
                    "Cached connection reports closed, establishing a new one"
                );
                state.slot = Slot::Absent;
            }

            match &state.slot {
                Slot::Pending { attempt, future } => {
                    debug!(
                        endpoint = %self.endpoint,
                        attempt = attempt,
                        "Joining in-flight connection attempt"
                    );
                    (*attempt, future.clone())
                }
                _ => {
                    state.attempts += 1;
                    let attempt = state.attempts;
                    let future = self.establish(attempt);
                    state.slot = Slot::Pending {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let outcome = future.await;

        let mut state = self.lock_state();
        let current = matches!(
            &state.slot,
            Slot::Pending { attempt: pending, .. } if *pending == attempt
        );

        match outcome {
            Ok(connection) => {
                if current {
                    state.slot = Slot::Established(Arc::clone(&connection));
                }
                Ok(connection)
            }
            Err(err) => {
                if current {
                    state.slot = Slot::Absent;
                }
                Err(SessionError::ConnectionEstablishment(err))
            }
        }
    }

    /// Drop the cached connection so the next call establishes a fresh one.
    ///
    /// An attempt that is already in flight is left alone.
    pub fn invalidate(&self) {
        let mut state = self.lock_state();
        if let Slot::Established(_) = state.slot {
            info!(endpoint = %self.endpoint, "Connection invalidated");
            state.slot = Slot::Absent;
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.lock_state().slot {
            Slot::Absent => ConnectionState::Absent,
            Slot::Pending { .. } => ConnectionState::Pending,
            Slot::Established(_) => ConnectionState::Established,
        }
    }

    /// Number of establishment attempts started so far.
    pub fn establish_count(&self) -> u64 {
        self.lock_state().attempts
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> Arc<T> {
        Arc::clone(&self.transport)
    }

    fn establish(&self, attempt: u64) -> EstablishFuture<T::Connection> {
        let transport = Arc::clone(&self.transport);
        let handshake = Handshake {
            endpoint: self.endpoint.clone(),
            registry: Arc::clone(&self.registry),
        };
        let timeout = self.handshake_timeout;

        async move {
            let endpoint = handshake.endpoint.clone();
            info!(
                endpoint = %endpoint,
                attempt = attempt,
                calls = handshake.registry.len(),
                "Establishing connection"
            );

            let result = match tokio::time::timeout(timeout, transport.connect(handshake)).await {
                Ok(result) => result,
                Err(elapsed) => Err(TransportError::from(elapsed)),
            };

            match result {
                Ok(connection) => {
                    info!(endpoint = %endpoint, attempt = attempt, "Connection established");
                    Ok(Arc::new(connection))
                }
                Err(err) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt,
                        error = %err,
                        "Connection attempt failed"
                    );
                    Err(Arc::new(err))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T::Connection>> {
        self.state.lock().expect("connection state lock poisoned")
    }
}
