use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::SessionError;
use crate::registry::{CallRegistry, Invokable, ValidationError};
use crate::transport::{Connection, Transport};

/// Forwards request/response calls over the shared connection.
///
/// Every call is one remote round trip. Nothing is retried and identical concurrent calls are
/// not merged; both belong to whatever caches results on top of the session.
pub struct InvocationDispatcher<T: Transport> {
    registry: Arc<CallRegistry>,
    connections: Arc<ConnectionManager<T>>,
}

impl<T: Transport> InvocationDispatcher<T> {
    pub fn new(registry: Arc<CallRegistry>, connections: Arc<ConnectionManager<T>>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Call the invokable `I` with `args` and decode its result.
    pub async fn invoke<I: Invokable>(&self, args: I::Args) -> Result<I::Returns, SessionError> {
        self.registry.invokable_of::<I>()?;
        let args = ValidationError::encode(&args)?;
        self.invoke_encoded::<I>(args).await
    }

    /// Call the invokable `I` with arguments that are already in their JSON form.
    pub(crate) async fn invoke_encoded<I: Invokable>(
        &self,
        args: Value,
    ) -> Result<I::Returns, SessionError> {
        self.registry.invokable_of::<I>()?;
        let result = self.send(I::NAME, args).await?;
        Ok(ValidationError::decode(result)?)
    }

    /// Call `name` by its registered name, validating `args` before anything is sent.
    ///
    /// The returned value is passed through as the connection delivered it.
    pub async fn invoke_raw(&self, name: &str, args: Value) -> Result<Value, SessionError> {
        let schema = self.registry.invokable(name)?;
        let args = schema.args.validate(&args)?;
        self.send(name, args).await
    }

    async fn send(&self, name: &str, args: Value) -> Result<Value, SessionError> {
        let connection = self.connections.ensure().await?;

        debug!(name = %name, "Invoking remote call");
        let result = connection.invoke(name, args).await;
        if let Err(err) = &result {
            debug!(name = %name, error = %err, "Remote call failed");
        }

        Ok(result?)
    }
}

impl<T: Transport> Clone for InvocationDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&self.connections),
        }
    }
}
